//! rowlineage core
//!
//! Core domain model shared by every crate of the workspace: rows and their
//! values, mapping records, configuration, diagnostics and capture summaries.
//! Never rename diagnostic codes or mapping fields - they are part of the public API.

pub mod diagnostic;
pub mod row;
pub mod mapping;
pub mod summary;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity};
pub use row::{Row, Value, TRACE_COLUMN, PARENT_TRACE_COLUMN};
pub use mapping::{format_timestamp, LineageMapping, TraceId, MAPPING_FIELDS};
pub use summary::{CaptureSummary, SummaryVersion, DiagnosticCounts};
pub use config::{
    LineageConfig, ConfigError, DialectConfig, ExportFormat, WildcardPolicy,
    ConnectionConfig, PostgresConnection, Correspondence, CorrespondenceRule, CorrespondenceStrategy,
};
