//! Columnar snapshot sink
//!
//! Each write produces one parquet file holding exactly the given batch. The
//! file is written next to the destination and renamed over it, so readers
//! see either the previous snapshot or the new one. Last writer wins.

use crate::lock::path_lock;
use crate::writer::{ExportError, LineageWriter, WriteMode};
use arrow_array::{Array, ArrayRef, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rowlineage_core::{LineageMapping, TraceId, MAPPING_FIELDS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Parquet snapshot writer
#[derive(Debug, Clone)]
pub struct ParquetWriter {
    path: PathBuf,
}

impl ParquetWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LineageWriter for ParquetWriter {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }

    fn mode(&self) -> WriteMode {
        WriteMode::Snapshot
    }

    async fn write(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        let batch = to_record_batch(records)?;

        let lock = path_lock(&self.path);
        let _guard = lock.lock().await;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &batch))
            .await
            .map_err(|e| ExportError::write_failed(self.destination(), e))??;

        debug!(path = %self.path.display(), records = records.len(), "Wrote parquet snapshot");
        Ok(records.len())
    }

    async fn read_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_parquet(&path))
            .await
            .map_err(|e| ExportError::read_failed(self.destination(), e))?
    }
}

/// Arrow schema of the snapshot, in sink field order
pub fn mapping_schema() -> SchemaRef {
    let mut fields: Vec<Field> = MAPPING_FIELDS[..5]
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, false))
        .collect();
    fields.push(Field::new(
        MAPPING_FIELDS[5],
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    ));
    Arc::new(Schema::new(fields))
}

fn text_array(records: &[LineageMapping], field: fn(&LineageMapping) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(field).collect::<Vec<_>>()))
}

fn to_record_batch(records: &[LineageMapping]) -> Result<RecordBatch, ExportError> {
    let executed_at: Vec<i64> = records
        .iter()
        .map(|r| r.executed_at.timestamp_micros())
        .collect();

    let columns: Vec<ArrayRef> = vec![
        text_array(records, |r| r.source_model.as_str()),
        text_array(records, |r| r.target_model.as_str()),
        text_array(records, |r| r.source_trace_id.as_str()),
        text_array(records, |r| r.target_trace_id.as_str()),
        text_array(records, |r| r.compiled_sql.as_str()),
        Arc::new(TimestampMicrosecondArray::from(executed_at).with_timezone("UTC")),
    ];

    RecordBatch::try_new(mapping_schema(), columns)
        .map_err(|e| ExportError::Serialization(e.to_string()))
}

fn write_snapshot(path: &Path, batch: &RecordBatch) -> Result<(), ExportError> {
    let destination = path.display().to_string();

    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| ExportError::unavailable(&destination, e))?;

    let temp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| ExportError::unavailable(&destination, e))?;
    let file = temp
        .reopen()
        .map_err(|e| ExportError::unavailable(&destination, e))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| ExportError::write_failed(&destination, e))?;
    writer
        .write(batch)
        .map_err(|e| ExportError::write_failed(&destination, e))?;
    writer
        .close()
        .map_err(|e| ExportError::write_failed(&destination, e))?;

    temp.as_file()
        .sync_all()
        .map_err(|e| ExportError::write_failed(&destination, e))?;
    temp.persist(path)
        .map_err(|e| ExportError::write_failed(&destination, e.error))?;

    Ok(())
}

/// Read every record of a snapshot file
pub fn read_parquet(path: &Path) -> Result<Vec<LineageMapping>, ExportError> {
    let destination = path.display().to_string();

    let file = std::fs::File::open(path).map_err(|e| ExportError::read_failed(&destination, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| ExportError::read_failed(&destination, e))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| ExportError::read_failed(&destination, e))?;
        records.extend(from_record_batch(&batch, &destination)?);
    }

    Ok(records)
}

fn text_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    destination: &str,
) -> Result<&'a StringArray, ExportError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ExportError::read_failed(destination, format!("missing text column {}", name)))
}

fn from_record_batch(batch: &RecordBatch, destination: &str) -> Result<Vec<LineageMapping>, ExportError> {
    let source_model = text_column(batch, MAPPING_FIELDS[0], destination)?;
    let target_model = text_column(batch, MAPPING_FIELDS[1], destination)?;
    let source_trace_id = text_column(batch, MAPPING_FIELDS[2], destination)?;
    let target_trace_id = text_column(batch, MAPPING_FIELDS[3], destination)?;
    let compiled_sql = text_column(batch, MAPPING_FIELDS[4], destination)?;
    let executed_at = batch
        .column_by_name(MAPPING_FIELDS[5])
        .and_then(|column| column.as_any().downcast_ref::<TimestampMicrosecondArray>())
        .ok_or_else(|| ExportError::read_failed(destination, "missing timestamp column executed_at"))?;

    (0..batch.num_rows())
        .map(|i| {
            if batch.columns().iter().any(|column| column.is_null(i)) {
                return Err(ExportError::read_failed(destination, format!("null value in row {}", i)));
            }

            let micros = executed_at.value(i);
            let executed_at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                ExportError::read_failed(destination, format!("timestamp out of range: {}", micros))
            })?;

            Ok(LineageMapping {
                source_model: source_model.value(i).to_string(),
                target_model: target_model.value(i).to_string(),
                source_trace_id: TraceId::new(source_trace_id.value(i)),
                target_trace_id: TraceId::new(target_trace_id.value(i)),
                compiled_sql: compiled_sql.value(i).to_string(),
                executed_at,
            })
        })
        .collect()
}
