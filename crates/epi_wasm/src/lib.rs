//! WASM bridge for the epidemic simulation core.

mod simulation;

pub use simulation::WasmSimulation;

use epi_core::combinatorics;
use epi_core::model::Division;
use epi_core::progress::Clock;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

/// [`Clock`] reading the JavaScript wall clock, which works where
/// `std::time::Instant` does not.
#[derive(Debug, Default)]
pub(crate) struct JsClock {
    started: Option<f64>,
}

impl Clock for JsClock {
    fn start(&mut self) {
        self.started = Some(js_sys::Date::now());
    }

    fn elapsed_secs(&self) -> f64 {
        self.started
            .map_or(0.0, |started| (js_sys::Date::now() - started) / 1000.0)
    }
}

pub(crate) fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

fn parse_divisions(divisions: JsValue) -> Result<Vec<Division>, JsValue> {
    from_value(divisions).map_err(|e| JsValue::from_str(&format!("Invalid divisions: {}", e)))
}

/// Compartment names for the given divisions, in simulation order.
#[wasm_bindgen]
pub fn generate_compartments(divisions: JsValue) -> Result<JsValue, JsValue> {
    let divisions = parse_divisions(divisions)?;
    let names = combinatorics::generate_compartments(&divisions);
    to_value(&names).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

/// Shortcuts (name, definition and members) implied by the given divisions.
#[wasm_bindgen]
pub fn generate_shortcuts(divisions: JsValue) -> Result<JsValue, JsValue> {
    let divisions = parse_divisions(divisions)?;
    let shortcuts = combinatorics::generate_shortcuts(&divisions);
    to_value(&shortcuts).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use epi_core::combinatorics::Shortcut;
    use epi_core::model::Category;
    use wasm_bindgen_test::wasm_bindgen_test;

    fn divisions() -> JsValue {
        let divisions = vec![
            Division {
                name: "Age".to_string(),
                categories: vec![
                    Category { name: "Y".to_string(), description: None },
                    Category { name: "O".to_string(), description: None },
                ],
            },
            Division {
                name: "Status".to_string(),
                categories: vec![
                    Category { name: "S".to_string(), description: None },
                    Category { name: "I".to_string(), description: None },
                ],
            },
        ];
        to_value(&divisions).expect("divisions")
    }

    #[wasm_bindgen_test]
    fn compartments_are_generated_from_js_divisions() {
        let names: Vec<String> =
            from_value(generate_compartments(divisions()).expect("compartments")).expect("names");
        assert_eq!(names, vec!["Y_S", "Y_I", "O_S", "O_I"]);
    }

    #[wasm_bindgen_test]
    fn shortcuts_are_generated_from_js_divisions() {
        let shortcuts: Vec<Shortcut> =
            from_value(generate_shortcuts(divisions()).expect("shortcuts")).expect("shortcuts");
        let young = shortcuts.iter().find(|s| s.name == "Y").expect("Y shortcut");
        assert_eq!(young.definition, "Y_S+Y_I");
    }

    #[wasm_bindgen_test]
    fn invalid_divisions_are_rejected() {
        let message = generate_compartments(JsValue::from_str("nope"))
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(message.contains("Invalid divisions"));
    }
}
