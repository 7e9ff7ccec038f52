//! Lineage orchestrator
//!
//! Owns the injector, the capturer and the configured writers, plus the state
//! of the current run. A run is bracketed by [`Orchestrator::begin_run`] and
//! [`Orchestrator::end_run`] (or [`Orchestrator::cancel_run`]); nothing
//! buffered during a run survives it.
//!
//! Models may execute concurrently. Each `on_execute` publishes its own rows
//! first, then waits (bounded) for its upstreams, so any topological
//! interleaving makes progress.
//!
//! Append sinks are written as each model is captured. Snapshot sinks receive
//! the whole run's records once, at `end_run`.

use crate::error::LineageError;
use crate::hooks::{ExecuteOutcome, LifecycleHooks};
use crate::store::RunStore;
use async_trait::async_trait;
use rowlineage_core::{
    CaptureSummary, Diagnostic, DiagnosticCode, LineageConfig, LineageMapping, Row,
};
use rowlineage_dbt::DependencyGraph;
use rowlineage_engine::{RowPairCapturer, Side};
use rowlineage_export::{open_writer, LineageWriter, WriteMode};
use rowlineage_sql::{InjectError, InjectStatus, TraceInjector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one run
struct RunState {
    id: String,
    graph: DependencyGraph,
    store: RunStore,

    /// Instrumented SQL per model, from `on_compile`
    compiled: Mutex<HashMap<String, String>>,

    /// Records waiting for the snapshot sinks
    snapshot: Mutex<Vec<LineageMapping>>,

    summary: Mutex<CaptureSummary>,
    cancelled: AtomicBool,
}

impl RunState {
    fn new(graph: DependencyGraph) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let store = RunStore::new(
            graph
                .models()
                .map(|model| (model.name.clone(), graph.children(&model.name).len()))
                .collect::<Vec<_>>(),
        );

        Self {
            summary: Mutex::new(CaptureSummary::new(id.clone())),
            id,
            graph,
            store,
            compiled: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<(), LineageError> {
        if self.is_cancelled() {
            Err(LineageError::Cancelled(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn record(&self, diagnostic: Diagnostic) {
        lock(&self.summary).add_diagnostic(diagnostic);
    }

    fn finished_summary(&self) -> CaptureSummary {
        let mut summary = lock(&self.summary).clone();
        summary.finish();
        summary
    }
}

/// Glues injection, capture and export to the host lifecycle
pub struct Orchestrator {
    config: LineageConfig,
    injector: TraceInjector,
    capturer: RowPairCapturer,
    writers: Vec<Arc<dyn LineageWriter>>,
    run: RwLock<Option<Arc<RunState>>>,
}

impl Orchestrator {
    /// Create an orchestrator with explicit writers
    pub fn new(config: LineageConfig, writers: Vec<Arc<dyn LineageWriter>>) -> Self {
        Self {
            injector: TraceInjector::from_config(&config),
            capturer: RowPairCapturer::new(),
            config,
            writers,
            run: RwLock::new(None),
        }
    }

    /// Create an orchestrator with the writer selected by `config`
    ///
    /// A disabled configuration opens no writer.
    pub async fn from_config(config: LineageConfig) -> Result<Self, LineageError> {
        let writers = if config.enabled {
            let writer = open_writer(&config)
                .await
                .map_err(|source| LineageError::Export {
                    sink: config.export_format.to_string(),
                    source,
                })?;
            vec![writer]
        } else {
            Vec::new()
        };

        Ok(Self::new(config, writers))
    }

    pub fn config(&self) -> &LineageConfig {
        &self.config
    }

    pub fn injector(&self) -> &TraceInjector {
        &self.injector
    }

    pub fn writers(&self) -> &[Arc<dyn LineageWriter>] {
        &self.writers
    }

    /// Identifier of the run in progress
    pub fn run_id(&self) -> Option<String> {
        self.current().ok().map(|run| run.id.clone())
    }

    fn current(&self) -> Result<Arc<RunState>, LineageError> {
        self.run
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(LineageError::NoActiveRun)
    }

    fn take_run(&self) -> Result<Arc<RunState>, LineageError> {
        self.run
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(LineageError::NoActiveRun)
    }

    /// Start a run over `graph`, returning its identifier
    pub fn begin_run(&self, graph: DependencyGraph) -> Result<String, LineageError> {
        let mut slot = self.run.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = slot.as_ref() {
            return Err(LineageError::RunInProgress(run.id.clone()));
        }

        let run = Arc::new(RunState::new(graph));
        info!(run_id = %run.id, models = run.graph.len(), "Lineage run started");
        let id = run.id.clone();
        *slot = Some(run);
        Ok(id)
    }

    /// Instrument a model's compiled SQL
    ///
    /// Idempotent. Failures are recorded against the run (when one is active)
    /// and returned; other models are unaffected.
    pub fn compile(&self, model: &str, compiled_sql: &str) -> Result<String, LineageError> {
        if !self.config.enabled {
            return Ok(compiled_sql.to_string());
        }

        let run = self.current().ok();

        match self.injector.instrument(compiled_sql) {
            Ok(instrumented) => {
                if instrumented.status == InjectStatus::WildcardPassThrough {
                    debug!(model = %model, "Wildcard select keeps the upstream trace column");
                } else {
                    debug!(model = %model, status = ?instrumented.status, "Compiled model instrumented");
                }
                if let Some(run) = run {
                    lock(&run.compiled).insert(model.to_string(), instrumented.sql.clone());
                }
                Ok(instrumented.sql)
            }
            Err(source) => {
                warn!(model = %model, error = %source, "Trace injection failed");
                if let Some(run) = run {
                    let diagnostic = match &source {
                        InjectError::Parse(parse) => parse.to_diagnostic(model),
                        other => Diagnostic::error(
                            DiagnosticCode::InjectionFailed,
                            format!("Cannot instrument {}: {}", model, other),
                        )
                        .with_model(model)
                        .with_detail(other.sql()),
                    };
                    run.record(diagnostic);
                }
                Err(LineageError::Inject {
                    model: model.to_string(),
                    source,
                })
            }
        }
    }

    /// SQL recorded for a model's mapping records
    fn compiled_sql_for(&self, run: &RunState, model: &str) -> String {
        if let Some(sql) = lock(&run.compiled).get(model) {
            return sql.clone();
        }

        // Executed without a compile hook: fall back to the graph's SQL
        run.graph
            .model(model)
            .and_then(|node| node.compiled_sql.as_deref())
            .map(|sql| self.injector.inject(sql).unwrap_or_else(|_| sql.to_string()))
            .unwrap_or_default()
    }

    /// Capture and export lineage for a model's materialized rows
    pub async fn execute(&self, model: &str, rows: Vec<Row>) -> Result<ExecuteOutcome, LineageError> {
        if !self.config.enabled {
            return Ok(ExecuteOutcome::default());
        }

        let run = self.current()?;
        run.ensure_active()?;
        if !run.graph.contains(model) {
            return Err(LineageError::UnknownModel(model.to_string()));
        }

        let target_rows = Arc::new(rows);
        run.store.put(model, Arc::clone(&target_rows))?;
        lock(&run.summary).models_processed += 1;

        let parents: Vec<String> = run
            .graph
            .parents(model)
            .into_iter()
            .map(str::to_string)
            .collect();
        if parents.is_empty() {
            debug!(model = %model, rows = target_rows.len(), "Root model buffered");
            return Ok(ExecuteOutcome::default());
        }

        let upstream_rows = match self.wait_for_parents(&run, model, &parents).await {
            Ok(upstream_rows) => upstream_rows,
            Err(err) => {
                for parent in &parents {
                    run.store.release(parent)?;
                }
                if err.is_missing_upstream() {
                    run.record(
                        Diagnostic::error(DiagnosticCode::MissingUpstreamCapture, err.to_string())
                            .with_model(model),
                    );
                }
                lock(&run.summary).edges_skipped += parents.len();
                return Err(err);
            }
        };

        let compiled_sql = self.compiled_sql_for(&run, model);
        let correspondence = self.config.correspondence_for(model);
        let mut outcome = ExecuteOutcome::default();
        let mut diagnostics = Vec::new();
        let mut skipped = 0;

        for (parent, source_rows) in &upstream_rows {
            let captured = self.capturer.capture_with(
                Side::new(parent, source_rows),
                Side::new(model, &target_rows),
                &compiled_sql,
                &correspondence,
            );
            run.store.release(parent)?;

            match captured {
                Ok(capture) => {
                    debug!(
                        source = %parent,
                        target = %model,
                        records = capture.records.len(),
                        "Edge captured"
                    );
                    diagnostics.extend(capture.diagnostics);
                    outcome.edges.push(parent.clone());
                    outcome.records.extend(capture.records);
                }
                Err(source) => {
                    warn!(source_model = %parent, target = %model, error = %source, "Edge capture failed");
                    skipped += 1;
                    diagnostics.push(
                        Diagnostic::error(DiagnosticCode::CaptureFailed, source.to_string())
                            .with_model(model)
                            .with_detail(compiled_sql.clone()),
                    );
                }
            }
        }

        // A cancelled run emits nothing, not even for edges already paired
        run.ensure_active()?;

        let (written, export_error) = self.export(&run, &outcome.records).await;
        outcome.written = written;

        {
            let mut summary = lock(&run.summary);
            summary.edges_captured += outcome.edges.len();
            summary.edges_skipped += skipped;
            summary.records_captured += outcome.records.len();
            for (sink, count) in &outcome.written {
                summary.add_written(sink, *count);
            }
            summary.extend_diagnostics(diagnostics);
        }

        info!(model = %model, edges = outcome.edges.len(), records = outcome.records.len(), "Lineage captured");

        match export_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    async fn wait_for_parents(
        &self,
        run: &RunState,
        model: &str,
        parents: &[String],
    ) -> Result<Vec<(String, Arc<Vec<Row>>)>, LineageError> {
        let timeout = self.config.upstream_wait_timeout();
        // None: too far out to represent, so the wait is effectively unbounded
        let deadline = Instant::now().checked_add(timeout);
        let mut upstream_rows = Vec::with_capacity(parents.len());

        for parent in parents {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            let rows = run.store.wait(model, parent, remaining).await?;
            upstream_rows.push((parent.clone(), rows));
        }

        Ok(upstream_rows)
    }

    /// Write to the append sinks and buffer for the snapshot sinks
    ///
    /// Every append sink is attempted; the first failure is returned.
    async fn export(
        &self,
        run: &RunState,
        records: &[LineageMapping],
    ) -> (Vec<(String, usize)>, Option<LineageError>) {
        let mut written = Vec::new();
        let mut first_error = None;

        if records.is_empty() {
            return (written, first_error);
        }

        for writer in &self.writers {
            match writer.mode() {
                WriteMode::Snapshot => {}
                WriteMode::Append => match writer.write(records).await {
                    Ok(count) => written.push((writer.destination(), count)),
                    Err(source) => {
                        error!(sink = %writer.destination(), error = %source, "Lineage export failed");
                        run.record(
                            Diagnostic::error(DiagnosticCode::ExportFailed, source.to_string())
                                .with_detail(writer.destination()),
                        );
                        if let rowlineage_export::ExportError::PartialWrite { written: count, .. } = &source {
                            written.push((writer.destination(), *count));
                        }
                        first_error.get_or_insert(LineageError::Export {
                            sink: writer.destination(),
                            source,
                        });
                    }
                },
            }
        }

        if self.writers.iter().any(|w| w.mode() == WriteMode::Snapshot) {
            lock(&run.snapshot).extend_from_slice(records);
        }

        (written, first_error)
    }

    /// A model finished without rows; its consumers stop waiting
    pub fn mark_finished(&self, model: &str) -> Result<(), LineageError> {
        let run = self.current()?;
        run.store.mark_missing(model)?;
        debug!(model = %model, "Model finished without a capture");
        Ok(())
    }

    /// Record a diagnostic against the run in progress
    pub fn record(&self, diagnostic: Diagnostic) -> Result<(), LineageError> {
        self.current()?.record(diagnostic);
        Ok(())
    }

    /// Abort the run: buffered rows and pending snapshot records are dropped
    pub fn cancel_run(&self) -> Result<CaptureSummary, LineageError> {
        let run = self.take_run()?;
        run.cancelled.store(true, Ordering::SeqCst);
        run.store.cancel();
        lock(&run.snapshot).clear();

        warn!(run_id = %run.id, "Lineage run cancelled");
        Ok(run.finished_summary())
    }

    /// Close the run: flush snapshot sinks and return the summary
    ///
    /// Snapshot failures are reported as diagnostics in the summary.
    pub async fn end_run(&self) -> Result<CaptureSummary, LineageError> {
        let run = self.take_run()?;
        let records = std::mem::take(&mut *lock(&run.snapshot));

        for writer in self.writers.iter().filter(|w| w.mode() == WriteMode::Snapshot) {
            match writer.write(&records).await {
                Ok(count) => {
                    lock(&run.summary).add_written(&writer.destination(), count);
                }
                Err(source) => {
                    error!(sink = %writer.destination(), error = %source, "Snapshot export failed");
                    run.record(
                        Diagnostic::error(DiagnosticCode::ExportFailed, source.to_string())
                            .with_detail(writer.destination()),
                    );
                }
            }
        }

        let summary = run.finished_summary();
        info!(
            run_id = %summary.run_id,
            models = summary.models_processed,
            edges = summary.edges_captured,
            records = summary.total_written(),
            "Lineage run finished"
        );
        Ok(summary)
    }
}

#[async_trait]
impl LifecycleHooks for Orchestrator {
    async fn on_compile(&self, model: &str, compiled_sql: &str) -> Result<String, LineageError> {
        self.compile(model, compiled_sql)
    }

    async fn on_execute(&self, model: &str, rows: Vec<Row>) -> Result<ExecuteOutcome, LineageError> {
        self.execute(model, rows).await
    }

    async fn on_skip(&self, model: &str) -> Result<(), LineageError> {
        self.mark_finished(model)
    }
}
