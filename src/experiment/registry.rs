//! Catalogue of experiment types, optionally arranged in nested groups.
//!
//! Every experiment gets a positional key: `.0` for the first top-level entry, `.1.2` for the
//! third entry of the second top-level group, and so on. Keys are stable as long as the
//! registration order is.

use super::ExperimentType;
use crate::error::{LabError, LabResult};

enum Node {
    Experiment(ExperimentType),
    Group(String, Vec<Node>),
}

/// A flattened registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Positional key, e.g. `.1.0`
    pub key: String,
    /// Names of the enclosing groups, outermost first
    pub groups: Vec<String>,
    /// The experiment type
    pub experiment: ExperimentType,
}

/// Ordered, nestable collection of experiment types.
#[derive(Default)]
pub struct ExperimentRegistry {
    nodes: Vec<Node>,
}

impl ExperimentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an experiment at this level.
    pub fn register(mut self, experiment: ExperimentType) -> Self {
        self.nodes.push(Node::Experiment(experiment));
        self
    }

    /// Append a named group built from another registry.
    pub fn register_group(mut self, name: impl Into<String>, group: ExperimentRegistry) -> Self {
        self.nodes.push(Node::Group(name.into(), group.nodes));
        self
    }

    /// All experiments in registration order, depth first.
    pub fn iter(&self) -> impl Iterator<Item = RegistryEntry> {
        let mut entries = Vec::new();
        flatten(&self.nodes, "", &mut Vec::new(), &mut entries);
        entries.into_iter()
    }

    /// Number of experiments, groups not counted.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no experiments are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up by positional key.
    pub fn get_by_key(&self, key: &str) -> Option<RegistryEntry> {
        self.iter().find(|entry| entry.key == key)
    }

    /// Look up by key, then type id, then display name (case-insensitive).
    pub fn find(&self, query: &str) -> LabResult<RegistryEntry> {
        let query = query.trim();
        self.get_by_key(query)
            .or_else(|| self.iter().find(|e| e.experiment.info().type_id == query))
            .or_else(|| {
                self.iter()
                    .find(|e| e.experiment.info().name.eq_ignore_ascii_case(query))
            })
            .ok_or_else(|| LabError::UnknownExperiment(query.to_string()))
    }
}

fn flatten(nodes: &[Node], prefix: &str, groups: &mut Vec<String>, out: &mut Vec<RegistryEntry>) {
    for (index, node) in nodes.iter().enumerate() {
        let key = format!("{prefix}.{index}");
        match node {
            Node::Experiment(experiment) => out.push(RegistryEntry {
                key,
                groups: groups.clone(),
                experiment: experiment.clone(),
            }),
            Node::Group(name, children) => {
                groups.push(name.clone());
                flatten(children, &key, groups, out);
                groups.pop();
            }
        }
    }
}
