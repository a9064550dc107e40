//! Batch-driven simulation runner for the browser.

use crate::{js_error, JsClock};
use anyhow::{anyhow, Context};
use epi_core::driver::{CancelFlag, Outcome, RunState, Simulation};
use epi_core::model::{ModelDefinition, ModelSnapshot};
use epi_core::progress::Progress;
use epi_core::settings::SimulationSettings;
use epi_core::sink::{MemoryStreamFactory, SimulationResult};
use epi_core::traits::NoProgress;
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use std::sync::Arc;
use wasm_bindgen::prelude::*;

/// Progress payload returned after each batch.
#[derive(Serialize)]
struct BatchProgress<'a> {
    done: bool,
    #[serde(flatten)]
    progress: &'a Progress,
}

#[wasm_bindgen]
pub struct WasmSimulation {
    simulation: Simulation,
    cancel: CancelFlag,
    streams: MemoryStreamFactory,
    outcome: Option<Outcome>,
}

fn build(model: JsValue, settings: JsValue) -> anyhow::Result<(Simulation, MemoryStreamFactory)> {
    let definition: ModelDefinition =
        from_value(model).map_err(|e| anyhow!("Invalid model: {}", e))?;
    let settings: SimulationSettings = if settings.is_undefined() || settings.is_null() {
        SimulationSettings::default()
    } else {
        from_value(settings).map_err(|e| anyhow!("Invalid settings: {}", e))?
    };
    let snapshot = ModelSnapshot::assemble(definition).context("Model rejected")?;
    let streams = MemoryStreamFactory::new();
    let simulation = Simulation::new(Arc::new(snapshot), settings, Box::new(streams.clone()))
        .context("Settings rejected")?
        .with_clock(Box::<JsClock>::default());
    Ok((simulation, streams))
}

#[wasm_bindgen]
impl WasmSimulation {
    #[wasm_bindgen(constructor)]
    pub fn new(model: JsValue, settings: JsValue) -> Result<WasmSimulation, JsValue> {
        console_error_panic_hook::set_once();

        let (simulation, streams) = build(model, settings).map_err(js_error)?;
        Ok(WasmSimulation {
            cancel: simulation.cancel_flag(),
            simulation,
            streams,
            outcome: None,
        })
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// Starts the run if needed, then takes up to `batch_size` steps.
    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        if self.outcome.is_none() {
            let mut outcome = None;
            if self.simulation.state() == RunState::Initializing {
                outcome = self.simulation.start();
            }
            if outcome.is_none() {
                outcome = self
                    .simulation
                    .advance(batch_size as usize, &mut NoProgress);
            }
            self.outcome = outcome;
        }

        if let Some(Outcome::Failed(error)) = &self.outcome {
            return Err(JsValue::from_str(&format!("Simulation failed: {}", error)));
        }
        self.get_progress()
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let progress = self.simulation.progress();
        let payload = BatchProgress {
            done: self.is_done(),
            progress: &progress,
        };
        to_value(&payload).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Requests cancellation; the next batch stops before committing a step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn get_result(&self) -> Result<JsValue, JsValue> {
        let results: &[SimulationResult] = match &self.outcome {
            Some(Outcome::Succeeded(results)) => results,
            Some(Outcome::Cancelled) => return Err(JsValue::from_str("Simulation was cancelled.")),
            Some(Outcome::Failed(error)) => {
                return Err(JsValue::from_str(&format!("Simulation failed: {}", error)))
            }
            None => return Err(JsValue::from_str("Simulation has not finished.")),
        };
        to_value(results).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Full-resolution values of one output stream, keyed by the location
    /// reported in the result.
    pub fn get_stream(&self, key: &str) -> Option<Vec<f64>> {
        self.streams.stream(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epi_core::model::{
        Category, Compartment, Division, FunctionSpec, Population, ResultSpec,
    };
    use wasm_bindgen_test::wasm_bindgen_test;

    fn decay_model() -> JsValue {
        let definition = ModelDefinition {
            population: Population {
                name: "N".to_string(),
                size: 1.0,
                divisions: vec![Division {
                    name: "State".to_string(),
                    categories: vec![Category {
                        name: "X".to_string(),
                        description: None,
                    }],
                }],
            },
            parameters: Vec::new(),
            compartments: vec![Compartment {
                name: "X".to_string(),
                initial: "1".to_string(),
                derivative: "-X".to_string(),
            }],
            processes: Vec::new(),
            results: vec![ResultSpec {
                title: "decay".to_string(),
                x_label: "t".to_string(),
                y_label: "x".to_string(),
                functions: vec![FunctionSpec {
                    name: "x".to_string(),
                    expression: "X".to_string(),
                    color: "#000000".to_string(),
                    weight: 1.0,
                }],
            }],
        };
        to_value(&definition).expect("model")
    }

    fn settings(tmax: f64) -> JsValue {
        let settings = SimulationSettings {
            tmax,
            seed: Some(1),
            ..SimulationSettings::default()
        };
        to_value(&settings).expect("settings")
    }

    #[wasm_bindgen_test]
    fn runs_in_batches_to_completion() {
        let mut sim = WasmSimulation::new(decay_model(), settings(1.0)).expect("simulation");
        assert!(sim.get_result().is_err());
        for _ in 0..10 {
            if sim.is_done() {
                break;
            }
            sim.run_steps(3).expect("batch");
        }
        assert!(sim.is_done());
        let results: Vec<SimulationResult> =
            from_value(sim.get_result().expect("result")).expect("results");
        assert_eq!(results[0].total_points, 11);
        let key = results[0].functions[0].stream.clone().expect("stream key");
        assert_eq!(sim.get_stream(&key).map(|s| s.len()), Some(11));
    }

    #[wasm_bindgen_test]
    fn cancel_ends_the_run() {
        let mut sim = WasmSimulation::new(decay_model(), settings(100.0)).expect("simulation");
        sim.run_steps(5).expect("batch");
        sim.cancel();
        sim.run_steps(5).expect("batch");
        assert!(sim.is_done());
        let message = sim.get_result().err().and_then(|e| e.as_string()).unwrap_or_default();
        assert!(message.contains("cancelled"));
    }

    #[wasm_bindgen_test]
    fn invalid_model_is_rejected() {
        let message = WasmSimulation::new(JsValue::from_str("nope"), JsValue::UNDEFINED)
            .err()
            .and_then(|e| e.as_string())
            .unwrap_or_default();
        assert!(message.contains("Invalid model"));
    }
}
