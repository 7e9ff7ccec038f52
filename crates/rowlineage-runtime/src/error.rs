//! Runtime errors

use rowlineage_core::ConfigError;
use rowlineage_dbt::GraphError;
use rowlineage_export::ExportError;
use rowlineage_sql::InjectError;
use std::time::Duration;

/// Row source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Query for {model} failed: {reason}\nSQL: {sql}")]
    Query { model: String, sql: String, reason: String },

    #[error("Failed to read relation {relation}: {reason}")]
    Relation { relation: String, reason: String },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Errors raised by the orchestrator and the project capture
#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    #[error("Injection failed for {model}: {source}")]
    Inject {
        model: String,
        #[source]
        source: InjectError,
    },

    #[error("Export to {sink} failed: {source}")]
    Export {
        sink: String,
        #[source]
        source: ExportError,
    },

    #[error("Upstream {upstream} of {model} finished without a capture")]
    MissingUpstreamCapture { model: String, upstream: String },

    #[error("Upstream {upstream} of {model} was not captured within {waited:?}")]
    UpstreamTimeout {
        model: String,
        upstream: String,
        waited: Duration,
    },

    #[error("Model {0} is not part of the current run")]
    UnknownModel(String),

    #[error("Model {0} was already executed in this run")]
    AlreadyExecuted(String),

    #[error("No run in progress")]
    NoActiveRun,

    #[error("Run {0} is already in progress")]
    RunInProgress(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LineageError {
    /// Whether the upstream side of an edge was never delivered
    ///
    /// Timeouts count as missing captures: the upstream is treated as finished
    /// without one.
    pub fn is_missing_upstream(&self) -> bool {
        matches!(
            self,
            LineageError::MissingUpstreamCapture { .. } | LineageError::UpstreamTimeout { .. }
        )
    }

    /// Whether the caller may retry the same batch
    pub fn is_retryable(&self) -> bool {
        match self {
            LineageError::Export { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
