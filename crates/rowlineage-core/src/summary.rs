//! Capture summary (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use crate::diagnostic::{Diagnostic, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl SummaryVersion {
    /// Current summary schema version
    pub const CURRENT: SummaryVersion = SummaryVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for SummaryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Diagnostic counts by severity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCounts {
    pub total: usize,
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

/// Outcome of one capture run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSummary {
    /// Schema version
    pub version: SummaryVersion,

    /// Run identifier
    pub run_id: String,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Models that reached the execute hook
    pub models_processed: usize,

    /// (upstream, model) pairs captured
    pub edges_captured: usize,

    /// Pairs skipped because a side was unavailable or failed
    pub edges_skipped: usize,

    /// Records produced by the capturer
    pub records_captured: usize,

    /// Records durably written, per sink destination
    pub records_written: BTreeMap<String, usize>,

    pub counts: DiagnosticCounts,

    pub diagnostics: Vec<Diagnostic>,
}

impl CaptureSummary {
    /// Create an empty summary for a run
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            version: SummaryVersion::CURRENT,
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            models_processed: 0,
            edges_captured: 0,
            edges_skipped: 0,
            records_captured: 0,
            records_written: BTreeMap::new(),
            counts: DiagnosticCounts::default(),
            diagnostics: Vec::new(),
        }
    }

    /// Add a diagnostic to the summary
    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.counts.errors += 1,
            Severity::Warn => self.counts.warnings += 1,
            Severity::Info => self.counts.info += 1,
        }

        self.counts.total += 1;
        self.diagnostics.push(diagnostic);
    }

    /// Add several diagnostics
    pub fn extend_diagnostics(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.add_diagnostic(diagnostic);
        }
    }

    /// Record written rows for a sink
    pub fn add_written(&mut self, sink: &str, count: usize) {
        *self.records_written.entry(sink.to_string()).or_insert(0) += count;
    }

    /// Total written across sinks
    pub fn total_written(&self) -> usize {
        self.records_written.values().sum()
    }

    /// Check if the run has any errors
    pub fn has_errors(&self) -> bool {
        self.counts.errors > 0
    }

    /// Mark the run as finished
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}
