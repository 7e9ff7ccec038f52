//! rowlineage runtime - run orchestration
//!
//! Connects the trace injector, the row pair capturer and the export sinks to
//! a host's model lifecycle:
//!
//! - [`Orchestrator`] holds one run at a time and implements [`LifecycleHooks`]
//! - [`capture_lineage_for_project`] drives a whole graph against a [`RowSource`]
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::from_config(config).await?;
//! let summary = capture_lineage_for_project(&orchestrator, graph, &source).await?;
//! summary.save_to_file(Path::new("target/lineage_summary.json"))?;
//! ```

pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod project;
pub mod source;
pub mod store;

pub use error::{LineageError, SourceError};
pub use hooks::{ExecuteOutcome, LifecycleHooks};
pub use orchestrator::Orchestrator;
pub use project::capture_lineage_for_project;
pub use source::{MemorySource, RowSource};
pub use store::{RunStore, SlotState};

#[cfg(feature = "postgres")]
pub use source::PostgresSource;
