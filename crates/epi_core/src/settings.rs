//! Integration settings and their preference-file loader.

use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegratorKind {
    #[default]
    Euler,
    Rkf45,
}

/// Options recognised by the integration drivers.
///
/// Every field is optional in a preferences file; missing ones fall back to
/// [`SimulationSettings::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub integrator: IntegratorKind,
    /// Fixed Euler step, or the initial RKF45 step.
    pub step: f64,
    /// Simulated time horizon.
    pub tmax: f64,
    /// RKF45 global error bound.
    pub tolerance: f64,
    pub h_min: f64,
    pub h_max: f64,
    /// Seed for every random draw in the run. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Approximate number of in-memory points kept per output function.
    pub sample_target: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            integrator: IntegratorKind::Euler,
            step: 0.1,
            tmax: 100.0,
            tolerance: 0.0001,
            h_min: 0.001,
            h_max: 0.5,
            seed: None,
            sample_target: 1000,
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(SimulationError::InvalidSettings(message.to_string()));
        if !(self.step.is_finite() && self.step > 0.0) {
            return invalid("step must be positive.");
        }
        if !(self.tmax.is_finite() && self.tmax > 0.0) {
            return invalid("tmax must be positive.");
        }
        if self.integrator == IntegratorKind::Rkf45 {
            if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
                return invalid("tolerance must be positive.");
            }
            if !(self.h_min > 0.0 && self.h_min <= self.h_max && self.h_max.is_finite()) {
                return invalid("step bounds must satisfy 0 < h_min <= h_max.");
            }
        }
        if self.sample_target == 0 {
            return invalid("sample_target must be at least 1.");
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: SimulationSettings = toml::from_str(text)
            .map_err(|e| SimulationError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SimulationError::io(format!("reading {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }

    /// Number of fixed steps an Euler run takes to reach `tmax`.
    pub fn fixed_step_count(&self) -> usize {
        (self.tmax / self.step).round() as usize
    }
}
