//! The integration driver.
//!
//! One [`Simulation`] owns the whole run lifecycle: opening streams, validating
//! the model, stepping with the configured strategy, reporting progress,
//! observing cancellation and cleaning up. Strategies only propose steps.
//!
//! Runs can be driven in batches with [`Simulation::start`] and
//! [`Simulation::advance`], or in one call with [`Simulation::run_to_end`].

use crate::equation_engine::Environment;
use crate::error::{Result, SimulationError};
use crate::model::ModelSnapshot;
use crate::pipeline::CompiledModel;
use crate::progress::{Clock, Progress, ProgressTracker, SystemClock};
use crate::settings::SimulationSettings;
use crate::sink::{self, ResultSink, SimulationResult, StreamFactory};
use crate::solvers::Stepper;
use crate::traits::{Horizon, ProgressSink, StepAttempt, StepStrategy};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Initializing,
    Validating,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Initializing => "initializing",
            RunState::Validating => "validating",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Set-once cancellation request shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded(Vec<SimulationResult>),
    Cancelled,
    Failed(SimulationError),
}

impl Outcome {
    pub fn state(&self) -> RunState {
        match self {
            Outcome::Succeeded(_) => RunState::Succeeded,
            Outcome::Cancelled => RunState::Cancelled,
            Outcome::Failed(_) => RunState::Failed,
        }
    }
}

/// Everything a run owns once validation has passed.
struct Run {
    model: CompiledModel,
    env: Environment,
    stepper: Stepper,
    sink: ResultSink,
    outputs: Vec<Vec<f64>>,
    horizon: Horizon,
    t: f64,
    steps: usize,
    h: f64,
}

impl Run {
    fn finished(&self) -> bool {
        match self.horizon {
            Horizon::Steps(total) => self.steps >= total,
            Horizon::Time(tmax) => self.t >= tmax,
        }
    }

    /// Attempts steps until one is accepted. Rejections shrink the step.
    fn attempt(&mut self, rng: &mut StdRng) -> Result<StepAttempt> {
        loop {
            let attempt = self
                .stepper
                .attempt_step(&mut self.model, &self.env, self.t, self.h, rng)?;
            if attempt.accepted {
                return Ok(attempt);
            }
            self.h = attempt.next_h;
        }
    }

    fn commit(&mut self, attempt: StepAttempt, step: f64, rng: &mut StdRng) -> Result<()> {
        let t = match self.horizon {
            // Multiplying avoids drift from summing a fixed step.
            Horizon::Steps(_) => (self.steps + 1) as f64 * step,
            Horizon::Time(_) => self.t + attempt.h,
        };
        self.model
            .store_compartments(&mut self.env, self.stepper.proposed_state());
        self.model.refresh_shortcuts(&mut self.env, rng)?;
        self.model.refresh_processes(&mut self.env, t, rng)?;
        self.model
            .evaluate_functions(&self.env, rng, &mut self.outputs)?;
        self.sink.record(t, &self.outputs)?;
        self.model.resample_parameters(&mut self.env, rng)?;
        self.t = t;
        self.steps += 1;
        self.h = attempt.next_h;
        Ok(())
    }
}

pub struct Simulation {
    snapshot: Arc<ModelSnapshot>,
    settings: SimulationSettings,
    factory: Box<dyn StreamFactory>,
    cancel: CancelFlag,
    tracker: ProgressTracker,
    rng: StdRng,
    state: RunState,
    run: Option<Run>,
    /// Steps and time reached when the run ended.
    ended_at: (usize, f64),
    results: Vec<SimulationResult>,
}

impl Simulation {
    pub fn new(
        snapshot: Arc<ModelSnapshot>,
        settings: SimulationSettings,
        factory: Box<dyn StreamFactory>,
    ) -> Result<Self> {
        settings.validate()?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            snapshot,
            settings,
            factory,
            cancel: CancelFlag::new(),
            tracker: ProgressTracker::new(Box::<SystemClock>::default()),
            rng,
            state: RunState::Initializing,
            run: None,
            ended_at: (0, 0.0),
            results: Vec::new(),
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.tracker = ProgressTracker::new(clock);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Results after the run has ended: populated on success, emptied of
    /// samples and stream locations otherwise.
    pub fn results(&self) -> &[SimulationResult] {
        &self.results
    }

    /// Simulated time reached so far.
    pub fn time(&self) -> f64 {
        self.position().1
    }

    fn position(&self) -> (usize, f64) {
        self.run
            .as_ref()
            .map_or(self.ended_at, |run| (run.steps, run.t))
    }

    /// Value of any bound model element in the committed environment.
    pub fn value_of(&self, name: &str) -> Option<f64> {
        let run = self.run.as_ref()?;
        run.model.value_of(&run.env, name)
    }

    pub fn progress(&self) -> Progress {
        let (steps, t) = self.position();
        self.tracker.snapshot(self.state, steps, t)
    }

    /// Opens the output streams, validates the model and records the t = 0
    /// row. Returns the outcome if the run failed before stepping.
    pub fn start(&mut self) -> Option<Outcome> {
        if self.state != RunState::Initializing {
            return None;
        }
        info!(
            integrator = ?self.settings.integrator,
            tmax = self.settings.tmax,
            step = self.settings.step,
            "initializing simulation"
        );
        let cadence = sink::cadence(
            self.settings.fixed_step_count(),
            self.settings.sample_target,
        );
        let sink = match ResultSink::open(&self.snapshot, self.factory.as_mut(), cadence) {
            Ok(sink) => sink,
            Err(e) => return Some(self.fail(e)),
        };

        self.state = RunState::Validating;
        debug!("validating model");
        match self.prepare(sink) {
            Ok(run) => {
                self.tracker.begin(run.horizon);
                self.run = Some(run);
                self.state = RunState::Running;
                info!("simulation running");
                None
            }
            Err((e, sink)) => {
                self.results = sink.abort();
                Some(self.fail(e))
            }
        }
    }

    fn prepare(
        &mut self,
        mut sink: ResultSink,
    ) -> std::result::Result<Run, (SimulationError, ResultSink)> {
        let (mut model, env) = match CompiledModel::validate(&self.snapshot, &mut self.rng) {
            Ok(compiled) => compiled,
            Err(e) => return Err((e, sink)),
        };
        let mut outputs: Vec<Vec<f64>> = model
            .function_layout()
            .into_iter()
            .map(|n| vec![0.0; n])
            .collect();
        let initial = model
            .evaluate_functions(&env, &mut self.rng, &mut outputs)
            .and_then(|()| sink.record(0.0, &outputs));
        if let Err(e) = initial {
            return Err((e, sink));
        }
        let stepper = Stepper::for_settings(&self.settings, model.compartment_count());
        let horizon = stepper.horizon(&self.settings);
        Ok(Run {
            model,
            env,
            stepper,
            sink,
            outputs,
            horizon,
            t: 0.0,
            steps: 0,
            h: self.settings.step,
        })
    }

    /// Takes up to `max_steps` accepted steps. Returns the outcome once the
    /// run reaches a terminal state.
    pub fn advance(&mut self, max_steps: usize, progress: &mut dyn ProgressSink) -> Option<Outcome> {
        if self.state != RunState::Running {
            return None;
        }
        for _ in 0..max_steps {
            let step = self.settings.step;
            let Some(run) = self.run.as_mut() else {
                return None;
            };
            if run.finished() {
                return Some(self.succeed(progress));
            }
            let attempt = match run.attempt(&mut self.rng) {
                Ok(attempt) => attempt,
                Err(e) => return Some(self.fail(e)),
            };
            if self.cancel.is_cancelled() {
                return Some(self.cancelled(progress));
            }
            if let Err(e) = run.commit(attempt, step, &mut self.rng) {
                return Some(self.fail(e));
            }
            if self.tracker.due(run.t) {
                let report = self.tracker.snapshot(RunState::Running, run.steps, run.t);
                debug!(percent = report.percent, status = %report.status, "progress");
                progress.report(&report);
            }
        }
        let finished = self.run.as_ref().map_or(false, Run::finished);
        if finished {
            return Some(self.succeed(progress));
        }
        None
    }

    /// Runs from start to a terminal state.
    pub fn run_to_end(&mut self, progress: &mut dyn ProgressSink) -> Outcome {
        if let Some(outcome) = self.start() {
            return outcome;
        }
        while self.state == RunState::Running {
            if let Some(outcome) = self.advance(usize::MAX, progress) {
                return outcome;
            }
        }
        Outcome::Failed(SimulationError::NotRunnable(self.state))
    }

    fn succeed(&mut self, progress: &mut dyn ProgressSink) -> Outcome {
        let Some(mut run) = self.run.take() else {
            return Outcome::Cancelled;
        };
        if let Err(e) = run.sink.finish() {
            self.ended_at = (run.steps, run.t);
            self.results = run.sink.abort();
            return self.fail(e);
        }
        let results = run.sink.into_results();
        self.results = results.clone();
        self.ended_at = (run.steps, run.t);
        self.state = RunState::Succeeded;
        info!(steps = run.steps, t = run.t, "simulation succeeded");
        progress.report(&self.tracker.snapshot(self.state, run.steps, run.t));
        Outcome::Succeeded(results)
    }

    fn cancelled(&mut self, progress: &mut dyn ProgressSink) -> Outcome {
        let (steps, t) = self.position();
        if let Some(run) = self.run.take() {
            self.ended_at = (run.steps, run.t);
            self.results = run.sink.abort();
        }
        self.state = RunState::Cancelled;
        info!(steps, t, "simulation cancelled");
        progress.report(&self.tracker.snapshot(self.state, steps, t));
        Outcome::Cancelled
    }

    fn fail(&mut self, error: SimulationError) -> Outcome {
        if let Some(run) = self.run.take() {
            self.ended_at = (run.steps, run.t);
            self.results = run.sink.abort();
        }
        self.state = RunState::Failed;
        info!(%error, "simulation failed");
        Outcome::Failed(error)
    }
}
