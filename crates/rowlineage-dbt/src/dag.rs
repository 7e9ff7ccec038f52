//! Dependency graph (DAG) of queryable models
//!
//! Nodes are keyed by model name. Only models, seeds and snapshots are graph
//! members; sources and tests are dropped along with the edges to them.

use crate::manifest::Manifest;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A named transformation step, immutable for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelNode {
    /// Model name (unique within the graph)
    pub name: String,

    /// Manifest unique_id, when loaded from a manifest
    pub unique_id: Option<String>,

    /// model, seed or snapshot
    pub resource_type: String,

    pub database: Option<String>,
    pub schema: Option<String>,
    pub alias: Option<String>,

    /// Compiled SELECT (seeds have none)
    pub compiled_sql: Option<String>,

    /// Upstream model names, in declaration order
    pub upstream: Vec<String>,
}

impl ModelNode {
    /// Create a model with no location and no upstreams
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_id: None,
            resource_type: "model".to_string(),
            database: None,
            schema: None,
            alias: None,
            compiled_sql: None,
            upstream: Vec::new(),
        }
    }

    /// Create a seed (a relation read as-is)
    pub fn seed(name: impl Into<String>) -> Self {
        Self {
            resource_type: "seed".to_string(),
            ..Self::new(name)
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.compiled_sql = Some(sql.into());
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn with_relation(mut self, schema: impl Into<String>, alias: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.alias = Some(alias.into());
        self
    }

    pub fn is_seed(&self) -> bool {
        self.resource_type == "seed"
    }

    /// Materialized location as (schema, table)
    pub fn relation(&self) -> Result<(String, String), GraphError> {
        let schema = self.schema.as_deref().filter(|s| !s.is_empty());
        let table = self
            .alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .or(Some(self.name.as_str()).filter(|n| !n.is_empty()));

        match (schema, table) {
            (Some(schema), Some(table)) => Ok((schema.to_string(), table.to_string())),
            _ => Err(GraphError::MissingRelation(self.name.clone())),
        }
    }
}

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    models: BTreeMap<String, ModelNode>,

    /// Reverse edges: model -> models that read from it
    children: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dependency graph from a manifest
    ///
    /// Dependencies on non-queryable nodes (sources, macros) are dropped.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, GraphError> {
        let names: HashMap<&str, &str> = manifest
            .queryable_nodes()
            .map(|node| (node.unique_id.as_str(), node.name.as_str()))
            .collect();

        let mut nodes: Vec<_> = manifest.queryable_nodes().collect();
        nodes.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));

        let mut graph = Self::new();
        for node in nodes {
            let upstream = node
                .depends_on
                .nodes
                .iter()
                .filter_map(|dep| names.get(dep.as_str()).map(|name| name.to_string()))
                .collect();

            graph.add_model(ModelNode {
                name: node.name.clone(),
                unique_id: Some(node.unique_id.clone()),
                resource_type: node.resource_type.clone(),
                database: node.database.clone(),
                schema: node.schema.clone(),
                alias: node.alias.clone(),
                compiled_sql: node.compiled_code.clone(),
                upstream,
            })?;
        }

        Ok(graph)
    }

    /// Add a model; upstreams may be added before or after it
    pub fn add_model(&mut self, model: ModelNode) -> Result<(), GraphError> {
        if self.models.contains_key(&model.name) {
            return Err(GraphError::DuplicateModel(model.name));
        }

        let mut seen = HashSet::new();
        for parent in &model.upstream {
            if seen.insert(parent.as_str()) {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(model.name.clone());
            }
        }

        self.models.insert(model.name.clone(), model);
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelNode> {
        self.models.get(name)
    }

    /// All models, ordered by name
    pub fn models(&self) -> impl Iterator<Item = &ModelNode> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Immediate upstreams that are graph members, deduplicated
    pub fn parents(&self, name: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.models
            .get(name)
            .map(|model| {
                model
                    .upstream
                    .iter()
                    .filter(|parent| self.models.contains_key(parent.as_str()))
                    .filter(|parent| seen.insert(parent.as_str()))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Immediate downstream models that are graph members
    pub fn children(&self, name: &str) -> Vec<&str> {
        let mut children: Vec<&str> = self
            .children
            .get(name)
            .map(|c| {
                c.iter()
                    .filter(|child| self.models.contains_key(child.as_str()))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default();
        children.sort_unstable();
        children
    }

    /// Every (upstream, downstream) pair, ordered by downstream then upstream
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges = BTreeSet::new();
        for model in self.models.values() {
            for parent in self.parents(&model.name) {
                edges.insert((model.name.as_str(), parent));
            }
        }
        edges.into_iter().map(|(child, parent)| (parent, child)).collect()
    }

    /// Models with no upstream inside the graph
    pub fn roots(&self) -> Vec<&str> {
        self.models
            .keys()
            .filter(|name| self.parents(name).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Get all downstream models (transitive closure of children)
    pub fn downstream(&self, name: &str) -> Vec<String> {
        self.walk(name, |graph, current| graph.children(current))
    }

    /// Get all upstream models (transitive closure of parents)
    pub fn upstream(&self, name: &str) -> Vec<String> {
        self.walk(name, |graph, current| graph.parents(current))
    }

    fn walk<'a, F>(&'a self, start: &str, next: F) -> Vec<String>
    where
        F: Fn(&'a Self, &str) -> Vec<&'a str>,
    {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&str> = next(self, start).into_iter().collect();
        let mut result = Vec::new();

        // BFS
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current.to_string());

            for neighbour in next(self, current) {
                if !visited.contains(neighbour) {
                    queue.push_back(neighbour);
                }
            }
        }

        result
    }

    /// Models in dependency order (Kahn's algorithm); None on cycles
    ///
    /// Ties are broken by name so the order is stable across runs.
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .models
            .keys()
            .map(|name| (name.as_str(), self.parents(name).len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut result = Vec::with_capacity(self.models.len());
        while let Some(node) = ready.pop_first() {
            result.push(node.to_string());

            for child in self.children(node) {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if result.len() == self.models.len() {
            Some(result)
        } else {
            None // Graph has cycles
        }
    }

    /// Topological order, or a cycle error naming the models left over
    pub fn ordered(&self) -> Result<Vec<String>, GraphError> {
        self.topological_sort().ok_or_else(|| {
            let mut remaining: Vec<String> = self.models.keys().cloned().collect();
            remaining.sort();
            GraphError::Cycle(remaining.join(", "))
        })
    }
}

/// Graph construction errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Model '{0}' is defined more than once")]
    DuplicateModel(String),

    #[error("Cannot determine schema/table for model '{0}'")]
    MissingRelation(String),

    #[error("Dependency graph has a cycle among: {0}")]
    Cycle(String),
}
