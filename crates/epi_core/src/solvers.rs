use crate::equation_engine::Environment;
use crate::error::{Result, SimulationError};
use crate::pipeline::CompiledModel;
use crate::settings::{IntegratorKind, SimulationSettings};
use crate::traits::{Horizon, StepAttempt, StepStrategy};
use rand::RngCore;
use tracing::{debug, warn};

/// Explicit Euler with a fixed step.
///
/// Every derivative is evaluated from the pre-update state before any
/// compartment changes, so the update is synchronous.
pub struct Euler {
    rates: Vec<f64>,
    state: Vec<f64>,
}

impl Euler {
    pub fn new(dim: usize) -> Self {
        Self {
            rates: vec![0.0; dim],
            state: vec![0.0; dim],
        }
    }
}

impl StepStrategy for Euler {
    fn attempt_step(
        &mut self,
        model: &mut CompiledModel,
        env: &Environment,
        _t: f64,
        h: f64,
        rng: &mut dyn RngCore,
    ) -> Result<StepAttempt> {
        model.compartment_values(env, &mut self.state);
        model.derivatives(env, rng, &mut self.rates)?;
        for (x, rate) in self.state.iter_mut().zip(&self.rates) {
            *x += h * rate;
        }
        Ok(StepAttempt {
            accepted: true,
            h,
            next_h: h,
            error: None,
        })
    }

    fn proposed_state(&self) -> &[f64] {
        &self.state
    }

    fn horizon(&self, settings: &SimulationSettings) -> Horizon {
        Horizon::Steps(settings.fixed_step_count())
    }
}

const STAGES: usize = 6;

// Fehlberg 4(5) tableau.
const C: [f64; STAGES] = [0.0, 1.0 / 4.0, 3.0 / 8.0, 12.0 / 13.0, 1.0, 1.0 / 2.0];

const A: [[f64; STAGES - 1]; STAGES - 1] = [
    [1.0 / 4.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 32.0, 9.0 / 32.0, 0.0, 0.0, 0.0],
    [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0, 0.0, 0.0],
    [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0, 0.0],
    [-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
];

const B4: [f64; STAGES] = [
    25.0 / 216.0,
    0.0,
    1408.0 / 2565.0,
    2197.0 / 4104.0,
    -1.0 / 5.0,
    0.0,
];

const B5: [f64; STAGES] = [
    16.0 / 135.0,
    0.0,
    6656.0 / 12825.0,
    28561.0 / 56430.0,
    -9.0 / 50.0,
    2.0 / 55.0,
];

/// Max-fold that keeps NaN, unlike `f64::max`.
fn sup_norm(acc: f64, d: f64) -> f64 {
    if acc.is_nan() || d.is_nan() {
        f64::NAN
    } else {
        acc.max(d)
    }
}

/// Adaptive Runge-Kutta-Fehlberg 4(5).
///
/// The fifth-order solution only estimates the local error; the state carried
/// forward is the fourth-order one.
pub struct Rkf45 {
    tolerance: f64,
    h_min: f64,
    h_max: f64,
    x0: Vec<f64>,
    k: [Vec<f64>; STAGES],
    trial: Vec<f64>,
    rk4: Vec<f64>,
    rk5: Vec<f64>,
    /// Stage environment E′, reseeded from the committed one on every attempt.
    scratch: Environment,
}

impl Rkf45 {
    pub fn new(dim: usize, tolerance: f64, h_min: f64, h_max: f64) -> Self {
        Self {
            tolerance,
            h_min,
            h_max,
            x0: vec![0.0; dim],
            k: std::array::from_fn(|_| vec![0.0; dim]),
            trial: vec![0.0; dim],
            rk4: vec![0.0; dim],
            rk5: vec![0.0; dim],
            scratch: Environment::new(),
        }
    }

    pub fn from_settings(dim: usize, settings: &SimulationSettings) -> Self {
        Self::new(dim, settings.tolerance, settings.h_min, settings.h_max)
    }

    fn weighted(&self, weights: &[f64; STAGES], out: &mut [f64], h: f64) {
        for (n, x) in out.iter_mut().enumerate() {
            let increment: f64 = weights
                .iter()
                .zip(&self.k)
                .map(|(w, k)| w * k[n])
                .sum();
            *x = self.x0[n] + h * increment;
        }
    }
}

impl StepStrategy for Rkf45 {
    fn attempt_step(
        &mut self,
        model: &mut CompiledModel,
        env: &Environment,
        t: f64,
        h: f64,
        rng: &mut dyn RngCore,
    ) -> Result<StepAttempt> {
        let h = h.clamp(self.h_min, self.h_max);
        model.compartment_values(env, &mut self.x0);
        self.scratch.clone_from(env);

        model.derivatives(&self.scratch, rng, &mut self.k[0])?;
        for stage in 1..STAGES {
            let row = &A[stage - 1];
            for (n, x) in self.trial.iter_mut().enumerate() {
                let increment: f64 = (0..stage).map(|j| row[j] * self.k[j][n]).sum();
                *x = self.x0[n] + h * increment;
            }
            model.store_compartments(&mut self.scratch, &self.trial);
            model.refresh_shortcuts(&mut self.scratch, rng)?;
            model.refresh_processes(&mut self.scratch, t + C[stage] * h, rng)?;
            model.derivatives(&self.scratch, rng, &mut self.k[stage])?;
        }

        let mut rk4 = std::mem::take(&mut self.rk4);
        let mut rk5 = std::mem::take(&mut self.rk5);
        self.weighted(&B4, &mut rk4, h);
        self.weighted(&B5, &mut rk5, h);
        let error = rk4
            .iter()
            .zip(&rk5)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, sup_norm);
        self.rk4 = rk4;
        self.rk5 = rk5;

        let q = (self.tolerance * h / (2.0 * error)).powf(0.25);
        // NaN compares false, so a NaN estimate is a rejection.
        let accepted = q >= 1.0;
        let next_h = if q.is_nan() { 0.5 * h } else { q * h };

        if !accepted && h <= self.h_min {
            if !error.is_finite() {
                let index = self
                    .rk4
                    .iter()
                    .zip(&self.rk5)
                    .position(|(a, b)| !a.is_finite() || !b.is_finite())
                    .unwrap_or(0);
                return Err(SimulationError::NonFinite {
                    name: model.compartment_name(index).unwrap_or_default().to_string(),
                    t,
                });
            }
            warn!(
                t,
                h,
                error,
                tolerance = self.tolerance,
                "step exceeds tolerance at minimum size; accepting"
            );
            return Ok(StepAttempt {
                accepted: true,
                h,
                next_h: self.h_min,
                error: Some(error),
            });
        }
        if !accepted {
            debug!(t, h, error, next_h, "step rejected");
        }

        Ok(StepAttempt {
            accepted,
            h,
            next_h,
            error: Some(error),
        })
    }

    fn proposed_state(&self) -> &[f64] {
        &self.rk4
    }

    fn horizon(&self, settings: &SimulationSettings) -> Horizon {
        Horizon::Time(settings.tmax)
    }
}

/// The integration strategies a run can be configured with.
pub enum Stepper {
    Euler(Euler),
    Rkf45(Rkf45),
}

impl Stepper {
    pub fn for_settings(settings: &SimulationSettings, dim: usize) -> Self {
        match settings.integrator {
            IntegratorKind::Euler => Stepper::Euler(Euler::new(dim)),
            IntegratorKind::Rkf45 => Stepper::Rkf45(Rkf45::from_settings(dim, settings)),
        }
    }

    pub fn kind(&self) -> IntegratorKind {
        match self {
            Stepper::Euler(_) => IntegratorKind::Euler,
            Stepper::Rkf45(_) => IntegratorKind::Rkf45,
        }
    }
}

impl StepStrategy for Stepper {
    fn attempt_step(
        &mut self,
        model: &mut CompiledModel,
        env: &Environment,
        t: f64,
        h: f64,
        rng: &mut dyn RngCore,
    ) -> Result<StepAttempt> {
        match self {
            Stepper::Euler(s) => s.attempt_step(model, env, t, h, rng),
            Stepper::Rkf45(s) => s.attempt_step(model, env, t, h, rng),
        }
    }

    fn proposed_state(&self) -> &[f64] {
        match self {
            Stepper::Euler(s) => s.proposed_state(),
            Stepper::Rkf45(s) => s.proposed_state(),
        }
    }

    fn horizon(&self, settings: &SimulationSettings) -> Horizon {
        match self {
            Stepper::Euler(s) => s.horizon(settings),
            Stepper::Rkf45(s) => s.horizon(settings),
        }
    }
}
