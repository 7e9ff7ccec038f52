//! Writer selection from configuration

use crate::jsonl::JsonlWriter;
use crate::parquet::ParquetWriter;
use crate::postgres::PostgresTable;
use crate::sqlite::SqliteTable;
use crate::table::TableWriter;
use crate::writer::{ExportError, LineageWriter};
use rowlineage_core::{ConnectionConfig, ExportFormat, LineageConfig};
use std::sync::Arc;
use tracing::info;

/// Open the writer configured by `config`
///
/// Fails with `Config` when the format lacks its path or connection.
pub async fn open_writer(config: &LineageConfig) -> Result<Arc<dyn LineageWriter>, ExportError> {
    config
        .validate()
        .map_err(|e| ExportError::Config(e.to_string()))?;

    let writer: Arc<dyn LineageWriter> = match config.export_format {
        ExportFormat::Jsonl => Arc::new(JsonlWriter::new(export_file(config)?)),
        ExportFormat::Parquet => Arc::new(ParquetWriter::new(export_file(config)?)),
        ExportFormat::Table => match &config.connection {
            Some(ConnectionConfig::Sqlite { path }) => {
                let path = if path.is_relative() && !config.project_root.as_os_str().is_empty() {
                    config.project_root.join(path)
                } else {
                    path.clone()
                };
                Arc::new(TableWriter::new(SqliteTable::new(path)))
            }
            Some(ConnectionConfig::Postgres(conn)) => {
                Arc::new(TableWriter::new(PostgresTable::connect(conn).await?))
            }
            None => {
                return Err(ExportError::Config(
                    "the table export format needs a connection".to_string(),
                ))
            }
        },
    };

    info!(sink = writer.name(), destination = %writer.destination(), "Opened lineage writer");
    Ok(writer)
}

fn export_file(config: &LineageConfig) -> Result<std::path::PathBuf, ExportError> {
    config.export_file().ok_or_else(|| {
        ExportError::Config(format!(
            "export_path is required for the {} export format",
            config.export_format
        ))
    })
}
