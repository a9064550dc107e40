//! Dependency-ordered evaluation of a model snapshot.
//!
//! [`CompiledModel::validate`] compiles and evaluates every element in the
//! fixed order parameters, compartment initial values, shortcuts, processes,
//! compartment derivatives, output functions. The first failure aborts with an
//! error naming that element. The resulting model exposes the per-step
//! operations the integration strategies and the driver need.

use crate::equation_engine::{Bytecode, Environment, Evaluator};
use crate::error::{Result, SimulationError};
use crate::model::graph::ElementKind;
use crate::model::{segment_index, ModelSnapshot};
use rand::RngCore;
use tracing::debug;

/// Name of the throwaway binding used while checking derivatives. It is not a
/// valid identifier, so no expression can read it.
const DERIVATIVE_PROBE: &str = "#derivative";

#[derive(Debug, Clone)]
pub struct CompiledElement {
    pub name: String,
    pub slot: usize,
    pub code: Bytecode,
}

#[derive(Debug, Clone)]
pub struct CompiledProcess {
    pub name: String,
    pub slot: usize,
    pub segments: Vec<(f64, Bytecode)>,
}

#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Bytecode,
}

#[derive(Debug)]
pub struct CompiledModel {
    evaluator: Evaluator,
    parameters: Vec<CompiledElement>,
    /// Compartment slots with their derivative expressions.
    compartments: Vec<CompiledElement>,
    shortcuts: Vec<CompiledElement>,
    processes: Vec<CompiledProcess>,
    functions: Vec<Vec<CompiledFunction>>,
}

impl CompiledModel {
    /// Compiles the snapshot and evaluates it at t = 0.
    ///
    /// Returns the compiled model together with the environment holding every
    /// element's initial value.
    pub fn validate(
        snapshot: &ModelSnapshot,
        rng: &mut dyn RngCore,
    ) -> Result<(CompiledModel, Environment)> {
        let mut evaluator = Evaluator::new();
        let mut env = Environment::new();
        evaluator.bind(&mut env, &snapshot.population.name, snapshot.population.size);

        let mut parameters = Vec::with_capacity(snapshot.parameters.len());
        for parameter in &snapshot.parameters {
            let kind = ElementKind::Parameter;
            let code = compile(&mut evaluator, kind, &parameter.name, &parameter.definition)?;
            let slot = evaluator.slot(&parameter.name);
            if code.references_slot(slot) {
                return Err(SimulationError::SelfReference {
                    kind,
                    name: parameter.name.clone(),
                });
            }
            let value = evaluate(&mut evaluator, kind, &parameter.name, &code, &env, rng)?;
            env.set(slot, value);
            parameters.push(CompiledElement {
                name: parameter.name.clone(),
                slot,
                code,
            });
        }

        let mut compartment_slots = Vec::with_capacity(snapshot.compartments.len());
        for compartment in &snapshot.compartments {
            let kind = ElementKind::Compartment;
            let code = compile(&mut evaluator, kind, &compartment.name, &compartment.initial)?;
            let value = evaluate(&mut evaluator, kind, &compartment.name, &code, &env, rng)?;
            let slot = evaluator.slot(&compartment.name);
            env.set(slot, value);
            compartment_slots.push(slot);
        }

        let mut shortcuts = Vec::with_capacity(snapshot.shortcuts.len());
        for shortcut in &snapshot.shortcuts {
            let kind = ElementKind::Shortcut;
            let code = compile(&mut evaluator, kind, &shortcut.name, &shortcut.definition)?;
            let value = evaluate(&mut evaluator, kind, &shortcut.name, &code, &env, rng)?;
            let slot = evaluator.slot(&shortcut.name);
            env.set(slot, value);
            shortcuts.push(CompiledElement {
                name: shortcut.name.clone(),
                slot,
                code,
            });
        }

        let mut processes = Vec::with_capacity(snapshot.processes.len());
        for process in &snapshot.processes {
            let kind = ElementKind::Process;
            if process.segments.is_empty() {
                return Err(SimulationError::EmptyProcess {
                    name: process.name.clone(),
                });
            }
            let slot = evaluator.slot(&process.name);
            let mut segments = Vec::with_capacity(process.segments.len());
            for segment in &process.segments {
                let code = compile(&mut evaluator, kind, &process.name, &segment.expression)?;
                if code.references_slot(slot) {
                    return Err(SimulationError::SelfReference {
                        kind,
                        name: process.name.clone(),
                    });
                }
                segments.push((segment.start, code));
            }
            let value = evaluate(&mut evaluator, kind, &process.name, &segments[0].1, &env, rng)?;
            env.set(slot, value);
            processes.push(CompiledProcess {
                name: process.name.clone(),
                slot,
                segments,
            });
        }

        let mut compartments = Vec::with_capacity(snapshot.compartments.len());
        for (compartment, slot) in snapshot.compartments.iter().zip(compartment_slots) {
            let kind = ElementKind::Compartment;
            let code = compile(&mut evaluator, kind, &compartment.name, &compartment.derivative)?;
            let rate = evaluate(&mut evaluator, kind, &compartment.name, &code, &env, rng)?;
            evaluator.bind(&mut env, DERIVATIVE_PROBE, rate);
            evaluator.unbind(&mut env, DERIVATIVE_PROBE);
            compartments.push(CompiledElement {
                name: compartment.name.clone(),
                slot,
                code,
            });
        }

        let mut functions = Vec::with_capacity(snapshot.results.len());
        for result in &snapshot.results {
            let mut compiled = Vec::with_capacity(result.functions.len());
            for function in &result.functions {
                let label = format!("{}/{}", result.title, function.name);
                let kind = ElementKind::Function;
                let code = compile(&mut evaluator, kind, &label, &function.expression)?;
                evaluate(&mut evaluator, kind, &label, &code, &env, rng)?;
                compiled.push(CompiledFunction { name: label, code });
            }
            functions.push(compiled);
        }

        debug!(
            parameters = parameters.len(),
            compartments = compartments.len(),
            shortcuts = shortcuts.len(),
            processes = processes.len(),
            symbols = evaluator.symbols().len(),
            "model validated"
        );

        Ok((
            CompiledModel {
                evaluator,
                parameters,
                compartments,
                shortcuts,
                processes,
                functions,
            },
            env,
        ))
    }

    pub fn compartment_count(&self) -> usize {
        self.compartments.len()
    }

    pub fn compartment_name(&self, index: usize) -> Option<&str> {
        self.compartments.get(index).map(|c| c.name.as_str())
    }

    /// Number of output functions per result, in result order.
    pub fn function_layout(&self) -> Vec<usize> {
        self.functions.iter().map(Vec::len).collect()
    }

    pub fn value_of(&self, env: &Environment, name: &str) -> Option<f64> {
        self.evaluator.value_of(env, name)
    }

    pub fn compartment_values(&self, env: &Environment, out: &mut [f64]) {
        for (value, compartment) in out.iter_mut().zip(&self.compartments) {
            *value = env.get(compartment.slot).unwrap_or(f64::NAN);
        }
    }

    pub fn store_compartments(&self, env: &mut Environment, values: &[f64]) {
        for (compartment, &value) in self.compartments.iter().zip(values) {
            env.set(compartment.slot, value);
        }
    }

    /// Evaluates every compartment's derivative in `env`.
    pub fn derivatives(
        &mut self,
        env: &Environment,
        rng: &mut dyn RngCore,
        out: &mut [f64],
    ) -> Result<()> {
        for (rate, compartment) in out.iter_mut().zip(&self.compartments) {
            *rate = self
                .evaluator
                .evaluate(&compartment.code, env, rng)
                .map_err(|e| {
                    SimulationError::from_eval(ElementKind::Compartment, &compartment.name, e)
                })?;
        }
        Ok(())
    }

    /// Recomputes every shortcut from the compartment values in `env`.
    pub fn refresh_shortcuts(&mut self, env: &mut Environment, rng: &mut dyn RngCore) -> Result<()> {
        for shortcut in &self.shortcuts {
            let value = self
                .evaluator
                .evaluate(&shortcut.code, env, rng)
                .map_err(|e| SimulationError::from_eval(ElementKind::Shortcut, &shortcut.name, e))?;
            env.set(shortcut.slot, value);
        }
        Ok(())
    }

    /// Recomputes every process using the segment in force at time `t`.
    pub fn refresh_processes(
        &mut self,
        env: &mut Environment,
        t: f64,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        for process in &self.processes {
            let Some(index) = segment_index(process.segments.iter().map(|(start, _)| *start), t)
            else {
                continue;
            };
            let value = self
                .evaluator
                .evaluate(&process.segments[index].1, env, rng)
                .map_err(|e| SimulationError::from_eval(ElementKind::Process, &process.name, e))?;
            env.set(process.slot, value);
        }
        Ok(())
    }

    /// Re-evaluates every parameter in declaration order. Stochastic
    /// definitions draw fresh samples.
    pub fn resample_parameters(&mut self, env: &mut Environment, rng: &mut dyn RngCore) -> Result<()> {
        for parameter in &self.parameters {
            let value = self
                .evaluator
                .evaluate(&parameter.code, env, rng)
                .map_err(|e| {
                    SimulationError::from_eval(ElementKind::Parameter, &parameter.name, e)
                })?;
            env.set(parameter.slot, value);
        }
        Ok(())
    }

    /// Evaluates every output function; `out` is shaped by
    /// [`CompiledModel::function_layout`].
    pub fn evaluate_functions(
        &mut self,
        env: &Environment,
        rng: &mut dyn RngCore,
        out: &mut [Vec<f64>],
    ) -> Result<()> {
        for (values, functions) in out.iter_mut().zip(&self.functions) {
            for (value, function) in values.iter_mut().zip(functions) {
                *value = self
                    .evaluator
                    .evaluate(&function.code, env, rng)
                    .map_err(|e| {
                        SimulationError::from_eval(ElementKind::Function, &function.name, e)
                    })?;
            }
        }
        Ok(())
    }
}

fn compile(
    evaluator: &mut Evaluator,
    kind: ElementKind,
    name: &str,
    text: &str,
) -> Result<Bytecode> {
    evaluator
        .compile(text)
        .map_err(|source| SimulationError::Syntax {
            kind,
            name: name.to_string(),
            source,
        })
}

fn evaluate(
    evaluator: &mut Evaluator,
    kind: ElementKind,
    name: &str,
    code: &Bytecode,
    env: &Environment,
    rng: &mut dyn RngCore,
) -> Result<f64> {
    evaluator
        .evaluate(code, env, rng)
        .map_err(|e| SimulationError::from_eval(kind, name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::{ModelDefinition, ModelSnapshot};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn validate(definition: ModelDefinition) -> Result<(CompiledModel, Environment)> {
        let snapshot = ModelSnapshot::assemble(definition).expect("model should assemble");
        let mut rng = StdRng::seed_from_u64(3);
        CompiledModel::validate(&snapshot, &mut rng)
    }

    #[test]
    fn initial_environment_holds_every_element() {
        let mut definition = age_sir();
        definition
            .processes
            .push(process("imports", &[(0.0, "beta * 10"), (30.0, "0")]));
        let (model, env) = validate(definition).expect("model should validate");

        assert_eq!(model.value_of(&env, "N"), Some(1000.0));
        assert_eq!(model.value_of(&env, "beta"), Some(0.3));
        assert_eq!(model.value_of(&env, "Y_S"), Some(590.0));
        assert_eq!(model.value_of(&env, "S"), Some(990.0));
        assert_eq!(model.value_of(&env, "I"), Some(10.0));
        assert_eq!(model.value_of(&env, "imports"), Some(3.0));
        assert_eq!(model.value_of(&env, DERIVATIVE_PROBE), None);
        assert_eq!(model.compartment_count(), 6);
        assert_eq!(model.function_layout(), vec![3]);
    }

    #[test]
    fn parameters_see_only_earlier_parameters() {
        let mut definition = single("1", "-X");
        definition.parameters.push(parameter("a", "2"));
        definition.parameters.push(parameter("b", "a * 3"));
        let (model, env) = validate(definition).expect("ordered parameters should validate");
        assert_eq!(model.value_of(&env, "b"), Some(6.0));

        let mut definition = single("1", "-X");
        definition.parameters.push(parameter("b", "a * 3"));
        definition.parameters.push(parameter("a", "2"));
        match validate(definition) {
            Err(SimulationError::Undefined { kind, name, symbol }) => {
                assert_eq!(kind, ElementKind::Parameter);
                assert_eq!(name, "b");
                assert_eq!(symbol, "a");
            }
            other => panic!("expected undefined error, got {other:?}"),
        }
    }

    #[test]
    fn self_referencing_parameter_is_rejected() {
        let mut definition = single("1", "-X");
        definition.parameters.push(parameter("k", "k * 2"));
        match validate(definition) {
            Err(SimulationError::SelfReference { kind, name }) => {
                assert_eq!(kind, ElementKind::Parameter);
                assert_eq!(name, "k");
            }
            other => panic!("expected self reference, got {other:?}"),
        }
    }

    #[test]
    fn process_with_undefined_compartment_names_the_process() {
        let mut definition = single("1", "-X");
        definition
            .processes
            .push(process("vaccination", &[(0.0, "0.1 * Y_S")]));
        let err = validate(definition).expect_err("should fail");
        assert_eq!(err.element(), Some((ElementKind::Process, "vaccination")));
        assert!(err.to_string().contains("'Y_S'"));
    }

    #[test]
    fn syntax_errors_name_the_element() {
        let mut definition = single("1", "-X");
        definition.results[0].functions[0].expression = "X +".to_string();
        let err = validate(definition).expect_err("should fail");
        assert!(matches!(err, SimulationError::Syntax { kind: ElementKind::Function, .. }));
        assert!(err.to_string().contains("state/x"));

        let err = validate(single("1", "-X *")).expect_err("should fail");
        assert_eq!(err.element(), Some((ElementKind::Compartment, "X")));
    }

    #[test]
    fn empty_process_is_rejected() {
        let mut definition = single("1", "-X");
        definition.processes.push(process("nothing", &[]));
        assert!(matches!(
            validate(definition),
            Err(SimulationError::EmptyProcess { .. })
        ));
    }

    #[test]
    fn domain_errors_surface_as_evaluation_failures() {
        let mut definition = single("1", "-X");
        definition.parameters.push(parameter("draw", "poisson(-1)"));
        let err = validate(definition).expect_err("should fail");
        assert!(matches!(err, SimulationError::Evaluation { kind: ElementKind::Parameter, .. }));
    }

    #[test]
    fn refresh_operations_follow_current_state() {
        let mut definition = age_sir();
        definition
            .processes
            .push(process("imports", &[(0.0, "1"), (30.0, "2")]));
        let (mut model, mut env) = validate(definition).expect("model should validate");
        let mut rng = StdRng::seed_from_u64(5);

        model.store_compartments(&mut env, &[500.0, 50.0, 40.0, 400.0, 10.0, 0.0]);
        model
            .refresh_shortcuts(&mut env, &mut rng)
            .expect("shortcuts should refresh");
        assert_eq!(model.value_of(&env, "I"), Some(60.0));
        assert_eq!(model.value_of(&env, "O"), Some(410.0));

        model
            .refresh_processes(&mut env, 31.0, &mut rng)
            .expect("processes should refresh");
        assert_eq!(model.value_of(&env, "imports"), Some(2.0));

        let mut rates = vec![0.0; 6];
        model
            .derivatives(&env, &mut rng, &mut rates)
            .expect("derivatives should evaluate");
        let infections = 0.3 * 500.0 * 60.0 / 1000.0;
        assert!((rates[0] + infections).abs() < 1e-12);
        assert!((rates[2] - 0.1 * 50.0).abs() < 1e-12);

        let mut outputs = vec![vec![0.0; 3]];
        model
            .evaluate_functions(&env, &mut rng, &mut outputs)
            .expect("functions should evaluate");
        assert_eq!(outputs[0], vec![900.0, 60.0, 40.0]);
    }
}
