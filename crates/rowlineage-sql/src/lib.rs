//! SQL parsing and trace injection
//!
//! This crate handles:
//! - Parsing compiled model SQL using datafusion-sqlparser-rs
//! - Rendering the trace expression for each warehouse dialect
//! - Injecting the `_row_trace_id` column into the outermost SELECT

pub mod parser;
pub mod dialect;
pub mod inject;

pub use parser::{SqlParser, ParsedSql, ParseError};
pub use dialect::{TraceExpression, NULL_MARKER, EMPTY_MARKER, MAX_CONCAT_ARGS, TRACE_NAMESPACE};
pub use inject::{TraceInjector, InjectError, InjectStatus, Instrumented, WRAPPED_RELATION};
