//! Error types for simulation runs.
//!
//! Every variant is fatal to the run that produced it. Cancellation is not an
//! error and is reported through [`crate::driver::Outcome::Cancelled`].

use crate::driver::RunState;
use crate::equation_engine::{EvalError, ParseError};
use crate::model::graph::ElementKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimulationError>;

#[derive(Debug, Error)]
pub enum SimulationError {
    /// The compartments loaded with the model differ from the ones generated
    /// from its divisions.
    #[error("compartment mismatch at position {position}: expected '{expected}', found '{found}'")]
    StructuralMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("name '{name}' is used by both {first} and {second}")]
    DuplicateName {
        name: String,
        first: ElementKind,
        second: ElementKind,
    },

    #[error("syntax error in {kind} '{name}': {source}")]
    Syntax {
        kind: ElementKind,
        name: String,
        #[source]
        source: ParseError,
    },

    #[error("{kind} '{name}' references '{symbol}', which is not defined")]
    Undefined {
        kind: ElementKind,
        name: String,
        symbol: String,
    },

    #[error("{kind} '{name}' references itself")]
    SelfReference { kind: ElementKind, name: String },

    #[error("process '{name}' has no segments")]
    EmptyProcess { name: String },

    #[error("cannot evaluate {kind} '{name}': {source}")]
    Evaluation {
        kind: ElementKind,
        name: String,
        #[source]
        source: EvalError,
    },

    /// The step-size controller reached its minimum without a finite error
    /// estimate.
    #[error("compartment '{name}' became non-finite at t = {t}")]
    NonFinite { name: String, t: f64 },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("simulation cannot run from state '{0}'")]
    NotRunnable(RunState),

    #[error("simulation worker panicked")]
    WorkerPanicked,
}

impl SimulationError {
    /// Attributes an evaluator failure to the element being evaluated.
    pub fn from_eval(kind: ElementKind, name: &str, err: EvalError) -> Self {
        match err {
            EvalError::Unbound(symbol) => SimulationError::Undefined {
                kind,
                name: name.to_string(),
                symbol,
            },
            other => SimulationError::Evaluation {
                kind,
                name: name.to_string(),
                source: other,
            },
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SimulationError::Io {
            context: context.into(),
            source,
        }
    }

    /// The element kind and name this error is attributed to, if any.
    pub fn element(&self) -> Option<(ElementKind, &str)> {
        match self {
            SimulationError::Syntax { kind, name, .. }
            | SimulationError::Undefined { kind, name, .. }
            | SimulationError::SelfReference { kind, name }
            | SimulationError::Evaluation { kind, name, .. } => Some((*kind, name.as_str())),
            SimulationError::EmptyProcess { name } => Some((ElementKind::Process, name.as_str())),
            SimulationError::NonFinite { name, .. } => {
                Some((ElementKind::Compartment, name.as_str()))
            }
            _ => None,
        }
    }
}
