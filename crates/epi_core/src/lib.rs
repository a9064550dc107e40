pub mod builtins;
pub mod combinatorics;
pub mod driver;
pub mod equation_engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod settings;
pub mod sink;
pub mod solvers;
/// The `epi_core` crate is the simulation engine for compartmental epidemic models.
/// Compartments come from the cross product of a population's divisions, and their
/// user-written derivative expressions are integrated over time.
///
/// Key components:
/// - **Combinatorics**: compartment and shortcut generation from divisions.
/// - **Equation Engine**: a bytecode VM for user expressions, with math builtins and random samplers.
/// - **Model / Pipeline**: the validated snapshot and its dependency-ordered evaluation.
/// - **Solvers**: explicit Euler and adaptive Runge-Kutta-Fehlberg 4(5) step strategies.
/// - **Driver / Worker**: run lifecycle, progress, cancellation and output streaming.
pub mod traits;
pub mod worker;

pub use driver::{CancelFlag, Outcome, RunState, Simulation};
pub use error::{Result, SimulationError};
pub use model::{ModelDefinition, ModelSnapshot};
pub use settings::{IntegratorKind, SimulationSettings};
