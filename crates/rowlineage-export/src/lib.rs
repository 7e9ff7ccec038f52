//! Export sinks for lineage mapping records
//!
//! Every sink stores the same six fields in the same order:
//! `source_model, target_model, source_trace_id, target_trace_id,
//! compiled_sql, executed_at`.
//!
//! - `jsonl` - append-log, one JSON object per line
//! - `parquet` - columnar snapshot, replaced on every write
//! - `table` - relational table `lineage__mappings` (SQLite, or PostgreSQL
//!   with the `postgres` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use rowlineage_export::{open_writer, LineageWriter};
//!
//! let writer = open_writer(&config).await?;
//! let written = writer.write(&records).await?;
//! ```

pub mod writer;
pub mod lock;
pub mod jsonl;
pub mod parquet;
pub mod table;
pub mod sqlite;
pub mod postgres;
pub mod memory;
pub mod open;

pub use writer::{ExportError, LineageWriter, WriteMode};
pub use jsonl::{read_jsonl, JsonlWriter};
pub use parquet::{read_parquet, ParquetWriter};
pub use table::{TableBackend, TableWriter, MAPPING_TABLE};
pub use sqlite::SqliteTable;
pub use postgres::PostgresTable;
pub use memory::MemoryWriter;
pub use open::open_writer;
