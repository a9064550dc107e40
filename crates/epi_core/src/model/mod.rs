//! Model definition and the validated, read-only snapshot a simulation runs on.
//!
//! A [`ModelDefinition`] is what a loader produces (it deserialises from JSON
//! or any other serde format). [`ModelSnapshot::assemble`] checks it against
//! the combinatorial structure of its population, generates the shortcuts and
//! builds the reference graph.

pub mod graph;

use crate::combinatorics::{generate_shortcuts, verify_compartments, Shortcut};
use crate::error::{Result, SimulationError};
use graph::{ElementKind, ReferenceGraph};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Division {
    pub name: String,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub name: String,
    pub size: f64,
    pub divisions: Vec<Division>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    pub name: String,
    /// Initial headcount, either a literal or an expression over parameters.
    pub initial: String,
    pub derivative: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Sorted ascending by start time.
    pub segments: Vec<Segment>,
}

impl Process {
    /// Index of the segment in force at time `t`: the last one whose start is
    /// not after `t`. When `t` precedes every start the last segment is used.
    pub fn segment_index_at(&self, t: f64) -> Option<usize> {
        segment_index(self.segments.iter().map(|s| s.start), t)
    }
}

/// Segment selection over ascending start times. Returns `None` only when
/// there are no segments.
pub fn segment_index(starts: impl IntoIterator<Item = f64>, t: f64) -> Option<usize> {
    let mut count = 0;
    let mut selected = None;
    for (i, start) in starts.into_iter().enumerate() {
        count = i + 1;
        if start <= t {
            selected = Some(i);
        }
    }
    if count == 0 {
        return None;
    }
    Some(selected.unwrap_or(count - 1))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_color() -> String {
    "#000000".to_string()
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSpec {
    pub title: String,
    #[serde(default)]
    pub x_label: String,
    #[serde(default)]
    pub y_label: String,
    pub functions: Vec<FunctionSpec>,
}

/// A model as produced by a loader, before structural checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub population: Population,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub compartments: Vec<Compartment>,
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default)]
    pub results: Vec<ResultSpec>,
}

/// The validated model one simulation runs against. Read-only once built.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub population: Population,
    pub parameters: Vec<Parameter>,
    pub compartments: Vec<Compartment>,
    pub shortcuts: Vec<Shortcut>,
    pub processes: Vec<Process>,
    pub results: Vec<ResultSpec>,
    reserved: HashSet<String>,
    graph: ReferenceGraph,
}

impl ModelSnapshot {
    pub fn assemble(definition: ModelDefinition) -> Result<Self> {
        let ModelDefinition {
            population,
            parameters,
            compartments,
            processes,
            results,
        } = definition;

        let loaded: Vec<String> = compartments.iter().map(|c| c.name.clone()).collect();
        verify_compartments(&population.divisions, &loaded)?;
        check_categories(&population)?;
        let shortcuts = generate_shortcuts(&population.divisions);

        let mut owners: HashMap<&str, ElementKind> = HashMap::new();
        owners.insert(population.name.as_str(), ElementKind::Population);
        let named = parameters
            .iter()
            .map(|p| (p.name.as_str(), ElementKind::Parameter))
            .chain(
                compartments
                    .iter()
                    .map(|c| (c.name.as_str(), ElementKind::Compartment)),
            )
            .chain(
                shortcuts
                    .iter()
                    .map(|s| (s.name.as_str(), ElementKind::Shortcut)),
            )
            .chain(processes.iter().map(|p| (p.name.as_str(), ElementKind::Process)));
        for (name, kind) in named {
            if let Some(first) = owners.insert(name, kind) {
                return Err(SimulationError::DuplicateName {
                    name: name.to_string(),
                    first,
                    second: kind,
                });
            }
        }
        let reserved = owners.keys().map(|name| name.to_string()).collect();

        let graph = ReferenceGraph::build(
            &population,
            &parameters,
            &compartments,
            &shortcuts,
            &processes,
            &results,
        );

        Ok(Self {
            population,
            parameters,
            compartments,
            shortcuts,
            processes,
            results,
            reserved,
            graph,
        })
    }

    /// Whether `name` is already taken by a model element.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    pub fn function_count(&self) -> usize {
        self.results.iter().map(|r| r.functions.len()).sum()
    }
}

fn check_categories(population: &Population) -> Result<()> {
    let mut seen = HashSet::new();
    for category in population.divisions.iter().flat_map(|d| &d.categories) {
        if !seen.insert(category.name.as_str()) {
            return Err(SimulationError::DuplicateName {
                name: category.name.clone(),
                first: ElementKind::Category,
                second: ElementKind::Category,
            });
        }
    }
    Ok(())
}
