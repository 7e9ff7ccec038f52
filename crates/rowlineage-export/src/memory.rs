//! In-memory writer for tests and dry runs
//!
//! Keeps every written record in a shared buffer and can simulate the failure
//! modes of real sinks: an unreachable destination, a batch that stops after
//! a number of records, and write latency.

use crate::writer::{ExportError, LineageWriter, WriteMode};
use async_trait::async_trait;
use rowlineage_core::LineageMapping;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory lineage writer
///
/// # Example
///
/// ```rust,ignore
/// let writer = MemoryWriter::new()
///     .with_latency(50)       // 50ms simulated latency
///     .with_partial_write(2); // keep 2 records of the next batch, then fail
/// ```
#[derive(Clone)]
pub struct MemoryWriter {
    records: Arc<RwLock<Vec<LineageMapping>>>,

    /// Number of write calls, including failed ones
    calls: Arc<RwLock<usize>>,

    mode: WriteMode,

    /// Fail every write as if the sink could not be reached
    unavailable: bool,

    /// Keep this many records of each batch, then fail
    fail_after: Option<usize>,

    latency_ms: u64,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            calls: Arc::new(RwLock::new(0)),
            mode: WriteMode::Append,
            unavailable: false,
            fail_after: None,
            latency_ms: 0,
        }
    }

    /// Replace contents on every write, like a snapshot sink
    pub fn snapshot() -> Self {
        Self {
            mode: WriteMode::Snapshot,
            ..Self::new()
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn with_partial_write(mut self, keep: usize) -> Self {
        self.fail_after = Some(keep);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Snapshot of the stored records
    pub async fn records(&self) -> Vec<LineageMapping> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn write_calls(&self) -> usize {
        *self.calls.read().await
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

impl Default for MemoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LineageWriter for MemoryWriter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn destination(&self) -> String {
        "memory".to_string()
    }

    fn mode(&self) -> WriteMode {
        self.mode
    }

    async fn write(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        *self.calls.write().await += 1;

        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }

        if self.unavailable {
            return Err(ExportError::unavailable(
                self.destination(),
                "Simulated connection failure",
            ));
        }

        let mut stored = self.records.write().await;
        if self.mode == WriteMode::Snapshot {
            stored.clear();
        }

        match self.fail_after {
            Some(keep) if keep < records.len() => {
                stored.extend_from_slice(&records[..keep]);
                Err(ExportError::PartialWrite {
                    destination: self.destination(),
                    written: keep,
                    total: records.len(),
                    reason: "Simulated write failure".to_string(),
                })
            }
            _ => {
                stored.extend_from_slice(records);
                Ok(records.len())
            }
        }
    }

    async fn read_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        Ok(self.records().await)
    }
}
