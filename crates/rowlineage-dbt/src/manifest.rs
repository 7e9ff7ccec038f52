//! dbt manifest.json parsing
//!
//! Parses the dbt-generated manifest.json to extract queryable nodes, their
//! relations, compiled SQL and dependencies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Resource types that materialize a relation rows can be read from
pub const QUERYABLE_RESOURCE_TYPES: [&str; 3] = ["model", "seed", "snapshot"];

/// dbt manifest.json structure (subset of fields we care about)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    #[serde(default)]
    pub metadata: ManifestMetadata,

    /// Model, seed, snapshot and test nodes
    pub nodes: HashMap<String, ManifestNode>,

    /// Source definitions (never graph members)
    #[serde(default)]
    pub sources: HashMap<String, serde_json::Value>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Enabled nodes that can carry row lineage (models, seeds, snapshots)
    pub fn queryable_nodes(&self) -> impl Iterator<Item = &ManifestNode> {
        self.nodes
            .values()
            .filter(|node| node.is_queryable() && node.config.enabled)
    }

    /// Get a specific node by unique_id
    pub fn get_node(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.nodes.get(unique_id)
    }
}

/// Manifest metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub dbt_schema_version: String,
    #[serde(default)]
    pub dbt_version: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub invocation_id: Option<String>,
}

/// A node in the manifest (model, seed, test, snapshot, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.jaffle_shop.customers")
    pub unique_id: String,

    /// Node name (e.g., "customers")
    pub name: String,

    /// Resource type (model, seed, test, snapshot, etc.)
    pub resource_type: String,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    /// Alias (output table name)
    #[serde(default)]
    pub alias: Option<String>,

    /// Compiled SQL (`compiled_sql` before dbt 1.3)
    #[serde(default, alias = "compiled_sql")]
    pub compiled_code: Option<String>,

    #[serde(default)]
    pub config: NodeConfig,

    #[serde(default)]
    pub depends_on: DependsOn,
}

impl ManifestNode {
    pub fn is_queryable(&self) -> bool {
        QUERYABLE_RESOURCE_TYPES.contains(&self.resource_type.as_str())
    }
}

/// The part of a node's config that decides graph membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Disabled nodes are never materialized
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),
}
