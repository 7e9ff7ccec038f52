//! Host lifecycle hooks
//!
//! A host adapter calls these around each model it runs: `on_compile` before
//! sending the compiled SQL to the warehouse, `on_execute` once the model's
//! result rows are materialized, and `on_skip` when the model finished
//! without producing rows (failure, skip, or selection exclusion).

use crate::error::LineageError;
use async_trait::async_trait;
use rowlineage_core::{LineageMapping, Row};

/// What one execute hook produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    /// Upstream models paired with this one
    pub edges: Vec<String>,

    /// Records produced for every edge, in capture order
    pub records: Vec<LineageMapping>,

    /// Records written per sink destination (snapshot sinks count at end of run)
    pub written: Vec<(String, usize)>,
}

impl ExecuteOutcome {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Capability a host calls around each model it runs
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Pre-execution hook: compiled SQL in, instrumented SQL out
    async fn on_compile(&self, model: &str, compiled_sql: &str) -> Result<String, LineageError>;

    /// Post-execution hook: the model's materialized rows
    async fn on_execute(&self, model: &str, rows: Vec<Row>) -> Result<ExecuteOutcome, LineageError>;

    /// The model finished without rows
    async fn on_skip(&self, model: &str) -> Result<(), LineageError>;
}
