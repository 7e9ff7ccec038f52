//! dbt artifact parsing and DAG construction
//!
//! This crate handles:
//! - Parsing manifest.json (dbt-generated artifacts)
//! - Building the dependency graph of queryable models
//! - Dependency order and transitive upstream/downstream queries

pub mod manifest;
pub mod dag;

pub use manifest::{Manifest, ManifestNode, NodeConfig, DependsOn, ManifestMetadata, ManifestError};
pub use dag::{DependencyGraph, ModelNode, GraphError};
