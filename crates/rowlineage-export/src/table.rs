//! Relational table sink
//!
//! One row per record in `lineage__mappings`. The table is created when
//! missing; concurrent writers rely on the database's own transaction and
//! locking discipline, so no in-process lock is taken.

use crate::writer::{ExportError, LineageWriter, WriteMode};
use async_trait::async_trait;
use rowlineage_core::LineageMapping;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Name of the mapping table
pub const MAPPING_TABLE: &str = "lineage__mappings";

/// A database that can hold the mapping table
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Backend name (e.g., "sqlite", "postgres")
    fn name(&self) -> &'static str;

    /// Qualified table name, as used in statements
    fn table(&self) -> String;

    /// Create the mapping table when it does not exist
    async fn ensure_table(&self) -> Result<(), ExportError>;

    /// Insert all records in one transaction
    async fn insert(&self, records: &[LineageMapping]) -> Result<usize, ExportError>;

    /// Every stored record
    async fn select_all(&self) -> Result<Vec<LineageMapping>, ExportError>;
}

/// Table writer over any [`TableBackend`]
pub struct TableWriter {
    backend: Box<dyn TableBackend>,
    ready: OnceCell<()>,
}

impl TableWriter {
    pub fn new(backend: impl TableBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            ready: OnceCell::new(),
        }
    }

    async fn ensure_ready(&self) -> Result<(), ExportError> {
        self.ready
            .get_or_try_init(|| async {
                self.backend.ensure_table().await?;
                info!(backend = self.backend.name(), table = %self.backend.table(), "Mapping table ready");
                Ok::<(), ExportError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LineageWriter for TableWriter {
    fn name(&self) -> &'static str {
        "table"
    }

    fn destination(&self) -> String {
        format!("{}:{}", self.backend.name(), self.backend.table())
    }

    fn mode(&self) -> WriteMode {
        WriteMode::Append
    }

    async fn write(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        self.ensure_ready().await?;
        if records.is_empty() {
            return Ok(0);
        }

        let written = self.backend.insert(records).await?;
        debug!(table = %self.destination(), records = written, "Inserted mapping records");
        Ok(written)
    }

    async fn read_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        self.ensure_ready().await?;
        self.backend.select_all().await
    }
}

/// `CREATE TABLE IF NOT EXISTS` statement, with the timestamp column type of
/// the backend
pub(crate) fn create_table_sql(table: &str, timestamp_type: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    source_model TEXT NOT NULL,\n    target_model TEXT NOT NULL,\n    source_trace_id TEXT NOT NULL,\n    target_trace_id TEXT NOT NULL,\n    compiled_sql TEXT NOT NULL,\n    executed_at {} NOT NULL\n)",
        table, timestamp_type
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowlineage_core::MAPPING_FIELDS;

    #[test]
    fn create_statement_lists_every_field_in_order() {
        let sql = create_table_sql(MAPPING_TABLE, "TIMESTAMPTZ");
        let positions: Vec<usize> = MAPPING_FIELDS
            .iter()
            .map(|field| sql.find(&format!("    {} ", field)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert!(sql.contains("executed_at TIMESTAMPTZ NOT NULL"));
    }
}
