//! Whole-project capture
//!
//! Walks the graph in dependency order and drives the lifecycle hooks for
//! every model, reading rows from a [`RowSource`]. A model that fails is
//! recorded in the summary and marked finished so its consumers stop waiting;
//! the walk continues with the rest of the graph.

use crate::error::LineageError;
use crate::orchestrator::Orchestrator;
use crate::source::RowSource;
use rowlineage_core::{CaptureSummary, Diagnostic, DiagnosticCode};
use rowlineage_dbt::{DependencyGraph, ModelNode};
use tracing::{info, warn};

/// Capture lineage for every model of `graph`
///
/// Only graph errors (a cycle) and a run already in progress abort the
/// capture; per-model failures end up as diagnostics.
pub async fn capture_lineage_for_project(
    orchestrator: &Orchestrator,
    graph: DependencyGraph,
    source: &dyn RowSource,
) -> Result<CaptureSummary, LineageError> {
    let order = graph.ordered()?;
    let nodes: Vec<ModelNode> = order
        .iter()
        .filter_map(|name| graph.model(name).cloned())
        .collect();

    orchestrator.begin_run(graph)?;
    info!(models = nodes.len(), source = source.name(), "Capturing project lineage");

    for node in &nodes {
        if let Err(err) = capture_model(orchestrator, node, source).await {
            warn!(model = %node.name, error = %err, "Model capture failed");

            // Hook failures already recorded their own diagnostic
            if let LineageError::Source(_) = err {
                orchestrator.record(
                    Diagnostic::error(DiagnosticCode::CaptureFailed, err.to_string())
                        .with_model(node.name.as_str()),
                )?;
            }
            orchestrator.mark_finished(&node.name)?;
        }
    }

    orchestrator.end_run().await
}

async fn capture_model(
    orchestrator: &Orchestrator,
    node: &ModelNode,
    source: &dyn RowSource,
) -> Result<(), LineageError> {
    let rows = if node.is_seed() {
        source.ensure_trace_column(node).await?;
        source.fetch_relation(node).await?
    } else {
        let compiled = node.compiled_sql.as_deref().unwrap_or_default();
        let sql = orchestrator.compile(&node.name, compiled)?;
        source.query(node, &sql).await?
    };

    orchestrator.execute(&node.name, rows).await?;
    Ok(())
}
