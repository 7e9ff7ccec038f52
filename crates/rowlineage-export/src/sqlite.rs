//! SQLite backend for the table sink

use crate::table::{create_table_sql, TableBackend, MAPPING_TABLE};
use crate::writer::ExportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowlineage_core::{format_timestamp, LineageMapping, TraceId};
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a writer waits for another connection's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Mapping table inside a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteTable {
    path: PathBuf,
}

impl SqliteTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> Result<Connection, ExportError> {
        let destination = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ExportError::unavailable(&destination, e))?;
        }

        let conn = Connection::open(path).map_err(|e| ExportError::unavailable(&destination, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| ExportError::unavailable(&destination, e))?;
        Ok(conn)
    }

    /// Column names of the mapping table, in table order
    pub fn column_names(&self) -> Result<Vec<String>, ExportError> {
        let conn = Self::open(&self.path)?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", MAPPING_TABLE))
            .map_err(|e| ExportError::read_failed(self.table(), e))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| ExportError::read_failed(self.table(), e))?;
        Ok(names)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ExportError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, ExportError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(&path))
            .await
            .map_err(|e| ExportError::write_failed(self.table(), e))?
    }
}

#[async_trait]
impl TableBackend for SqliteTable {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn table(&self) -> String {
        format!("{}#{}", self.path.display(), MAPPING_TABLE)
    }

    async fn ensure_table(&self) -> Result<(), ExportError> {
        self.blocking(|path| {
            let conn = SqliteTable::open(path)?;
            conn.execute_batch(&create_table_sql(MAPPING_TABLE, "TEXT"))
                .map_err(|e| ExportError::unavailable(path.display(), e))
        })
        .await
    }

    async fn insert(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        let records = records.to_vec();
        self.blocking(move |path| {
            let destination = path.display().to_string();
            let mut conn = SqliteTable::open(path)?;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| ExportError::unavailable(&destination, e))?;
            {
                let mut stmt = tx
                    .prepare(&format!(
                        "INSERT INTO {} (source_model, target_model, source_trace_id, target_trace_id, compiled_sql, executed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        MAPPING_TABLE
                    ))
                    .map_err(|e| ExportError::write_failed(&destination, e))?;

                for record in &records {
                    stmt.execute(params![
                        record.source_model,
                        record.target_model,
                        record.source_trace_id.as_str(),
                        record.target_trace_id.as_str(),
                        record.compiled_sql,
                        format_timestamp(&record.executed_at),
                    ])
                    .map_err(|e| ExportError::write_failed(&destination, e))?;
                }
            }
            tx.commit()
                .map_err(|e| ExportError::write_failed(&destination, e))?;

            Ok(records.len())
        })
        .await
    }

    async fn select_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        self.blocking(|path| {
            let destination = path.display().to_string();
            let conn = SqliteTable::open(path)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT source_model, target_model, source_trace_id, target_trace_id, compiled_sql, executed_at FROM {} ORDER BY rowid",
                    MAPPING_TABLE
                ))
                .map_err(|e| ExportError::read_failed(&destination, e))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                .map_err(|e| ExportError::read_failed(&destination, e))?;

            rows.into_iter()
                .map(|(source_model, target_model, source, target, compiled_sql, executed_at)| {
                    let executed_at = DateTime::parse_from_rfc3339(&executed_at)
                        .map_err(|e| ExportError::read_failed(&destination, e))?
                        .with_timezone(&Utc);
                    Ok(LineageMapping {
                        source_model,
                        target_model,
                        source_trace_id: TraceId::new(source),
                        target_trace_id: TraceId::new(target),
                        compiled_sql,
                        executed_at,
                    })
                })
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableWriter;
    use crate::writer::LineageWriter;
    use chrono::TimeZone;
    use rowlineage_core::MAPPING_FIELDS;

    fn record(n: usize) -> LineageMapping {
        LineageMapping {
            source_model: "stg".to_string(),
            target_model: "fct".to_string(),
            source_trace_id: TraceId::new(format!("s{}", n)),
            target_trace_id: TraceId::new("t"),
            compiled_sql: "select 'it''s'".to_string(),
            executed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn schema_is_created_once_and_appended_to() {
        let dir = tempfile::tempdir().unwrap();
        let table = SqliteTable::new(dir.path().join("lineage.db"));

        let first = TableWriter::new(table.clone());
        first.write(&[record(1)]).await.unwrap();
        assert_eq!(table.column_names().unwrap(), MAPPING_FIELDS.to_vec());

        // A fresh writer re-checks the table and appends
        let second = TableWriter::new(table.clone());
        second.write(&[record(2), record(3)]).await.unwrap();
        assert_eq!(table.column_names().unwrap(), MAPPING_FIELDS.to_vec());

        let stored = second.read_all().await.unwrap();
        assert_eq!(stored, vec![record(1), record(2), record(3)]);
    }

    #[tokio::test]
    async fn empty_batch_still_creates_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = SqliteTable::new(dir.path().join("lineage.db"));

        assert_eq!(TableWriter::new(table.clone()).write(&[]).await.unwrap(), 0);
        assert_eq!(table.column_names().unwrap().len(), MAPPING_FIELDS.len());
    }
}
