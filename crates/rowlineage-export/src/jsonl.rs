//! Append-log sink: one JSON object per line
//!
//! The file and its parent directories are created on first write and never
//! truncated by a successful write. Each batch is serialized up front, then
//! appended under the path lock in one `write_all` and synced before
//! returning. A failed append is cut back to the previous end of file, so no
//! half-written line is left behind.

use crate::lock::path_lock;
use crate::writer::{ExportError, LineageWriter, WriteMode};
use async_trait::async_trait;
use rowlineage_core::LineageMapping;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON lines append-log writer
#[derive(Debug, Clone)]
pub struct JsonlWriter {
    path: PathBuf,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LineageWriter for JsonlWriter {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }

    fn mode(&self) -> WriteMode {
        WriteMode::Append
    }

    async fn write(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        if records.is_empty() {
            return Ok(0);
        }

        let lines = records
            .iter()
            .map(|record| {
                serde_json::to_string(record)
                    .map(|mut line| {
                        line.push('\n');
                        line
                    })
                    .map_err(|e| ExportError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let lock = path_lock(&self.path);
        let _guard = lock.lock().await;

        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || append_lines(&path, &lines))
            .await
            .map_err(|e| ExportError::write_failed(self.destination(), e))??;

        debug!(path = %self.path.display(), records = written, "Appended mapping records");
        Ok(written)
    }

    async fn read_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_jsonl(&path))
            .await
            .map_err(|e| ExportError::read_failed(self.destination(), e))?
    }
}

fn append_lines(path: &Path, lines: &[String]) -> Result<usize, ExportError> {
    let destination = path.display().to_string();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ExportError::unavailable(&destination, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ExportError::unavailable(&destination, e))?;

    let written = write_batch(&mut file, &destination, lines)?;

    file.sync_data()
        .map_err(|e| ExportError::write_failed(&destination, e))?;

    Ok(written)
}

/// File that a failed append can be cut back on
trait AppendTarget: Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn write_batch<T: AppendTarget>(target: &mut T, destination: &str, lines: &[String]) -> Result<usize, ExportError> {
    let start = target
        .end()
        .map_err(|e| ExportError::unavailable(destination, e))?;

    if let Err(e) = target.write_all(lines.concat().as_bytes()) {
        if target.truncate(start).is_ok() {
            return Err(ExportError::unavailable(destination, e));
        }

        // Could not roll back: report the whole lines that made it
        let persisted = target.end().map(|end| end.saturating_sub(start)).unwrap_or(0);
        return Err(ExportError::PartialWrite {
            destination: destination.to_string(),
            written: complete_lines(lines, persisted),
            total: lines.len(),
            reason: e.to_string(),
        });
    }

    Ok(lines.len())
}

/// Number of leading lines fully contained in `bytes`
fn complete_lines(lines: &[String], bytes: u64) -> usize {
    let mut remaining = bytes;
    lines
        .iter()
        .take_while(|line| {
            let len = line.len() as u64;
            if len <= remaining {
                remaining -= len;
                true
            } else {
                false
            }
        })
        .count()
}

/// Read every record of an append-log
///
/// A missing file reads as empty; blank lines are skipped.
pub fn read_jsonl(path: &Path) -> Result<Vec<LineageMapping>, ExportError> {
    let destination = path.display().to_string();

    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ExportError::read_failed(destination, e)),
    };

    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ExportError::read_failed(&destination, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            ExportError::read_failed(&destination, format!("line {}: {}", number + 1, e))
        })?;
        records.push(record);
    }

    Ok(records)
}
