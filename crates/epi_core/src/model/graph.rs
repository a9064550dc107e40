//! Directed reference graph between model elements.
//!
//! Built once per snapshot from the identifiers each element's expressions
//! read. Elements are keyed by a stable [`ElementId`] and looked up by name in
//! constant time.

use super::{Compartment, Parameter, Population, Process, ResultSpec};
use crate::combinatorics::Shortcut;
use crate::equation_engine::parse;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Population,
    Category,
    Parameter,
    Compartment,
    Shortcut,
    Process,
    Function,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ElementKind::Population => "population",
            ElementKind::Category => "category",
            ElementKind::Parameter => "parameter",
            ElementKind::Compartment => "compartment",
            ElementKind::Shortcut => "shortcut",
            ElementKind::Process => "process",
            ElementKind::Function => "output function",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub kind: ElementKind,
    pub index: usize,
}

impl ElementId {
    pub fn new(kind: ElementKind, index: usize) -> Self {
        Self { kind, index }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    by_name: HashMap<String, ElementId>,
    names: HashMap<ElementId, String>,
    references: HashMap<ElementId, Vec<ElementId>>,
    referenced_by: HashMap<ElementId, Vec<ElementId>>,
    unresolved: HashMap<ElementId, Vec<String>>,
}

impl ReferenceGraph {
    pub fn build(
        population: &Population,
        parameters: &[Parameter],
        compartments: &[Compartment],
        shortcuts: &[Shortcut],
        processes: &[Process],
        results: &[ResultSpec],
    ) -> Self {
        let mut graph = ReferenceGraph::default();
        graph.name(ElementId::new(ElementKind::Population, 0), &population.name);
        for (i, p) in parameters.iter().enumerate() {
            graph.name(ElementId::new(ElementKind::Parameter, i), &p.name);
        }
        for (i, c) in compartments.iter().enumerate() {
            graph.name(ElementId::new(ElementKind::Compartment, i), &c.name);
        }
        for (i, s) in shortcuts.iter().enumerate() {
            graph.name(ElementId::new(ElementKind::Shortcut, i), &s.name);
        }
        for (i, p) in processes.iter().enumerate() {
            graph.name(ElementId::new(ElementKind::Process, i), &p.name);
        }

        for (i, p) in parameters.iter().enumerate() {
            graph.link(ElementId::new(ElementKind::Parameter, i), [p.definition.as_str()]);
        }
        for (i, c) in compartments.iter().enumerate() {
            graph.link(
                ElementId::new(ElementKind::Compartment, i),
                [c.initial.as_str(), c.derivative.as_str()],
            );
        }
        for (i, s) in shortcuts.iter().enumerate() {
            graph.link(ElementId::new(ElementKind::Shortcut, i), [s.definition.as_str()]);
        }
        for (i, p) in processes.iter().enumerate() {
            graph.link(
                ElementId::new(ElementKind::Process, i),
                p.segments.iter().map(|s| s.expression.as_str()),
            );
        }
        let functions = results.iter().flat_map(|r| {
            r.functions
                .iter()
                .map(move |f| (format!("{}/{}", r.title, f.name), f.expression.as_str()))
        });
        for (i, (label, expression)) in functions.enumerate() {
            let id = ElementId::new(ElementKind::Function, i);
            graph.names.insert(id, label);
            graph.link(id, [expression]);
        }
        graph
    }

    fn name(&mut self, id: ElementId, name: &str) {
        self.by_name.insert(name.to_string(), id);
        self.names.insert(id, name.to_string());
    }

    // Unparseable expressions contribute no edges; validation reports them.
    fn link<'a>(&mut self, from: ElementId, expressions: impl IntoIterator<Item = &'a str>) {
        let mut targets = Vec::new();
        let mut missing = Vec::new();
        for text in expressions {
            let Ok(expr) = parse(text) else { continue };
            for ident in expr.identifiers() {
                match self.by_name.get(&ident) {
                    Some(&to) if !targets.contains(&to) => targets.push(to),
                    Some(_) => {}
                    None if !missing.contains(&ident) => missing.push(ident),
                    None => {}
                }
            }
        }
        for &to in &targets {
            self.referenced_by.entry(to).or_default().push(from);
        }
        self.references.insert(from, targets);
        if !missing.is_empty() {
            self.unresolved.insert(from, missing);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ElementId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ElementId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Elements whose values `id`'s expressions read.
    pub fn references(&self, id: ElementId) -> &[ElementId] {
        self.references.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Elements whose expressions read `id`.
    pub fn referenced_by(&self, id: ElementId) -> &[ElementId] {
        self.referenced_by.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn is_self_referencing(&self, id: ElementId) -> bool {
        self.references(id).contains(&id)
    }

    /// Identifiers read by `id` that name no element of the model.
    pub fn unresolved(&self, id: ElementId) -> &[String] {
        self.unresolved.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Names of the processes and compartments that read `id`.
    pub fn linked_names(&self, id: ElementId) -> Vec<&str> {
        self.referenced_by(id)
            .iter()
            .filter(|from| matches!(from.kind, ElementKind::Process | ElementKind::Compartment))
            .filter_map(|from| self.name_of(*from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::ModelSnapshot;

    #[test]
    fn references_resolve_by_name() {
        let snapshot = ModelSnapshot::assemble(age_sir()).expect("model should assemble");
        let graph = snapshot.graph();

        let beta = graph.lookup("beta").expect("beta should be indexed");
        assert_eq!(beta, ElementId::new(ElementKind::Parameter, 0));
        let infected = graph.lookup("I").expect("I shortcut should be indexed");
        assert_eq!(infected.kind, ElementKind::Shortcut);

        let y_s = graph.lookup("Y_S").expect("Y_S should be indexed");
        let refs = graph.references(y_s);
        assert!(refs.contains(&beta));
        assert!(refs.contains(&infected));
        assert!(refs.contains(&ElementId::new(ElementKind::Population, 0)));
        assert!(!graph.is_self_referencing(beta));

        // The I shortcut sums Y_I and O_I.
        assert_eq!(graph.references(infected).len(), 2);
    }

    #[test]
    fn linked_names_lists_readers() {
        let snapshot = ModelSnapshot::assemble(age_sir()).expect("model should assemble");
        let graph = snapshot.graph();
        let gamma = graph.lookup("gamma_rate").expect("gamma_rate should be indexed");
        let mut linked = graph.linked_names(gamma);
        linked.sort();
        assert_eq!(linked, vec!["O_I", "O_R", "Y_I", "Y_R"]);
    }

    #[test]
    fn self_reference_and_unresolved_names_are_recorded() {
        let mut definition = single("1", "-k*X");
        definition.parameters.push(parameter("k", "k + 1"));
        definition.processes.push(process("p", &[(0.0, "missing * 2")]));
        let snapshot = ModelSnapshot::assemble(definition).expect("model should assemble");
        let graph = snapshot.graph();

        let k = graph.lookup("k").expect("k should be indexed");
        assert!(graph.is_self_referencing(k));
        let p = graph.lookup("p").expect("p should be indexed");
        assert_eq!(graph.unresolved(p), &["missing".to_string()]);
        let function = ElementId::new(ElementKind::Function, 0);
        assert_eq!(graph.name_of(function), Some("state/x"));
    }
}
