use crate::equation_engine::Environment;
use crate::error::Result;
use crate::pipeline::CompiledModel;
use crate::progress::Progress;
use crate::settings::SimulationSettings;
use rand::RngCore;

/// How far a run has to go, in the unit its remaining-time estimate uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Horizon {
    /// A fixed number of equal steps.
    Steps(usize),
    /// A simulated-time horizon reached by steps of varying size.
    Time(f64),
}

/// The verdict of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepAttempt {
    pub accepted: bool,
    /// Step size the attempt was computed with.
    pub h: f64,
    /// Step size to propose for the next attempt.
    pub next_h: f64,
    /// Local error estimate, for strategies that compute one.
    pub error: Option<f64>,
}

/// A pluggable integration step.
///
/// Implementors compute a candidate compartment state from the committed
/// environment without modifying it. The driver owns everything else: the
/// commit, output streaming, parameter resampling and the run lifecycle.
pub trait StepStrategy {
    /// Attempts a step of size `h` from time `t`. On acceptance the new
    /// compartment values are available through [`StepStrategy::proposed_state`].
    fn attempt_step(
        &mut self,
        model: &mut CompiledModel,
        env: &Environment,
        t: f64,
        h: f64,
        rng: &mut dyn RngCore,
    ) -> Result<StepAttempt>;

    /// Compartment values computed by the last accepted attempt, in
    /// compartment order.
    fn proposed_state(&self) -> &[f64];

    fn horizon(&self, settings: &SimulationSettings) -> Horizon;
}

/// Receives progress reports from a running simulation.
pub trait ProgressSink {
    fn report(&mut self, progress: &Progress);
}

impl<F: FnMut(&Progress)> ProgressSink for F {
    fn report(&mut self, progress: &Progress) {
        self(progress)
    }
}

/// Discards every report.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: &Progress) {}
}
