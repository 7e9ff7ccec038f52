//! Writer trait shared by every export sink

use async_trait::async_trait;
use rowlineage_core::LineageMapping;

/// How a sink treats successive batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Every batch is added to what is already there
    Append,

    /// Every batch replaces the previous contents
    Snapshot,
}

/// Errors that can occur when exporting mapping records
///
/// `SinkUnavailable`, `PartialWrite` and `WriteFailed` are retryable by the
/// caller at batch granularity; nothing is retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Sink unavailable ({destination}): {reason}")]
    SinkUnavailable { destination: String, reason: String },

    #[error("Partial write to {destination}: {written} of {total} records persisted: {reason}")]
    PartialWrite {
        destination: String,
        written: usize,
        total: usize,
        reason: String,
    },

    #[error("Write to {destination} failed: {reason}")]
    WriteFailed { destination: String, reason: String },

    #[error("Failed to serialize mapping record: {0}")]
    Serialization(String),

    #[error("Failed to read {destination}: {reason}")]
    ReadFailed { destination: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExportError {
    /// Whether retrying the same batch may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::SinkUnavailable { .. }
                | ExportError::PartialWrite { .. }
                | ExportError::WriteFailed { .. }
        )
    }

    pub(crate) fn unavailable(destination: impl ToString, reason: impl ToString) -> Self {
        ExportError::SinkUnavailable {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write_failed(destination: impl ToString, reason: impl ToString) -> Self {
        ExportError::WriteFailed {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn read_failed(destination: impl ToString, reason: impl ToString) -> Self {
        ExportError::ReadFailed {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Trait for sinks that persist lineage mapping records
#[async_trait]
pub trait LineageWriter: Send + Sync {
    /// Sink name (e.g., "jsonl", "parquet", "table")
    fn name(&self) -> &'static str;

    /// Human readable destination (file path or table)
    fn destination(&self) -> String;

    fn mode(&self) -> WriteMode;

    /// Persist a batch, returning the number of records written
    ///
    /// An empty batch is a no-op for append sinks.
    async fn write(&self, records: &[LineageMapping]) -> Result<usize, ExportError>;

    /// Read back everything the sink holds, in write order
    async fn read_all(&self) -> Result<Vec<LineageMapping>, ExportError>;
}
