//! Row pair capture
//!
//! Turns an upstream and a downstream result set into lineage mapping
//! records. Rows are paired through a [`Correspondence`]:
//!
//! - `TraceId`: the target row carries the source row's trace id
//! - `ParentTokens`: the target row lists its source ids in
//!   `_row_parent_trace_ids` (`alias:trace_id` tokens)
//! - `Columns`: source and target share a business key
//!
//! Every pair yields one record, so a target row fed by N source rows yields
//! N records sharing its trace id. Records come out in target row order, then
//! source row order.

use crate::identity::{self, canonical_value, DeriveError};
use chrono::{DateTime, SubsecRound, Utc};
use rowlineage_core::{
    Correspondence, Diagnostic, DiagnosticCode, LineageMapping, Row, TraceId,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Capture errors that abort the whole edge
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Key column '{column}' not found in rows of model '{model}'")]
    MissingKeyColumn { model: String, column: String },

    #[error("Invalid correspondence for {target_model}: {reason}")]
    InvalidCorrespondence { target_model: String, reason: String },
}

/// Records and signals produced for one (source, target) pair
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub records: Vec<LineageMapping>,

    /// Non-fatal findings (duplicates, untraced rows, underivable rows)
    pub diagnostics: Vec<Diagnostic>,

    /// Target rows with no corresponding source row
    pub unmatched_targets: usize,

    /// Shared capture timestamp of every record
    pub executed_at: DateTime<Utc>,
}

impl CaptureOutcome {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One model's side of an edge
#[derive(Debug, Clone, Copy)]
pub struct Side<'a> {
    pub model: &'a str,
    pub rows: &'a [Row],
}

impl<'a> Side<'a> {
    pub fn new(model: &'a str, rows: &'a [Row]) -> Self {
        Self { model, rows }
    }
}

/// Pairs source and target rows into mapping records
///
/// Stateless; the timestamp is taken once per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowPairCapturer;

impl RowPairCapturer {
    pub fn new() -> Self {
        Self
    }

    /// Capture with automatic correspondence
    pub fn capture(
        &self,
        source: Side<'_>,
        target: Side<'_>,
        compiled_sql: &str,
    ) -> Result<CaptureOutcome, CaptureError> {
        self.capture_with(source, target, compiled_sql, &Correspondence::Auto)
    }

    /// Capture with an explicit correspondence
    pub fn capture_with(
        &self,
        source: Side<'_>,
        target: Side<'_>,
        compiled_sql: &str,
        correspondence: &Correspondence,
    ) -> Result<CaptureOutcome, CaptureError> {
        let executed_at = Utc::now().trunc_subsecs(6);
        let mut diagnostics = Vec::new();

        let source_ids = trace_ids(source, &mut diagnostics);
        let target_ids = trace_ids(target, &mut diagnostics);
        report_duplicates(source.model, &source_ids, &mut diagnostics);
        report_duplicates(target.model, &target_ids, &mut diagnostics);

        let strategy = resolve(correspondence, target.rows);
        debug!(
            source = %source.model,
            target = %target.model,
            strategy = ?strategy,
            "Capturing row pairs"
        );

        let pairs = match &strategy {
            Correspondence::Columns { source: source_keys, target: target_keys } => {
                pair_by_columns(source, target, source_keys, target_keys, &source_ids, &target_ids)?
            }
            Correspondence::ParentTokens => pair_by_tokens(target, &source_ids, &target_ids),
            Correspondence::TraceId | Correspondence::Auto => pair_by_trace_id(&source_ids, &target_ids),
        };

        let unmatched_targets = pairs.unmatched;
        if unmatched_targets > 0 {
            diagnostics.push(
                Diagnostic::info(
                    DiagnosticCode::UntracedTargetRow,
                    format!(
                        "{} of {} rows of '{}' have no corresponding row in '{}'",
                        unmatched_targets,
                        target.rows.len(),
                        target.model,
                        source.model
                    ),
                )
                .with_model(target.model),
            );
        }

        let records = pairs
            .pairs
            .into_iter()
            .map(|(source_id, target_id)| LineageMapping {
                source_model: source.model.to_string(),
                target_model: target.model.to_string(),
                source_trace_id: source_id,
                target_trace_id: target_id,
                compiled_sql: compiled_sql.to_string(),
                executed_at,
            })
            .collect();

        Ok(CaptureOutcome {
            records,
            diagnostics,
            unmatched_targets,
            executed_at,
        })
    }
}

struct Pairing {
    pairs: Vec<(TraceId, TraceId)>,
    unmatched: usize,
}

/// `Auto` becomes `ParentTokens` when any target row carries tokens
fn resolve(correspondence: &Correspondence, target_rows: &[Row]) -> Correspondence {
    match correspondence {
        Correspondence::Auto => {
            if target_rows.iter().any(|row| row.parent_tokens().is_some()) {
                Correspondence::ParentTokens
            } else {
                Correspondence::TraceId
            }
        }
        other => other.clone(),
    }
}

/// Trace id per row; rows whose id cannot be derived get `None` and an
/// error diagnostic
fn trace_ids(side: Side<'_>, diagnostics: &mut Vec<Diagnostic>) -> Vec<Option<TraceId>> {
    side.rows
        .iter()
        .enumerate()
        .map(|(index, row)| match identity::trace_id_or_derive(row) {
            Ok(id) => Some(id),
            Err(DeriveError::UnsupportedColumnType { column, type_name }) => {
                warn!(model = %side.model, row = index, column = %column, "Cannot derive trace id");
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticCode::CaptureFailed,
                        format!(
                            "Row {} of '{}' has no trace id and column '{}' ({}) cannot be canonicalized",
                            index, side.model, column, type_name
                        ),
                    )
                    .with_model(side.model)
                    .with_detail(format!("{:?}", row.columns)),
                );
                None
            }
        })
        .collect()
}

fn report_duplicates(model: &str, ids: &[Option<TraceId>], diagnostics: &mut Vec<Diagnostic>) {
    let mut counts: HashMap<&TraceId, usize> = HashMap::new();
    for id in ids.iter().flatten() {
        *counts.entry(id).or_insert(0) += 1;
    }

    let mut duplicates: Vec<(&TraceId, usize)> =
        counts.into_iter().filter(|(_, count)| *count > 1).collect();
    duplicates.sort();

    for (id, count) in duplicates {
        warn!(model = %model, trace_id = %id, occurrences = count, "Duplicate trace id");
        diagnostics.push(
            Diagnostic::warn(
                DiagnosticCode::DuplicateTraceId,
                format!("Trace id appears {} times in '{}'", count, model),
            )
            .with_model(model)
            .with_detail(id.to_string()),
        );
    }
}

/// Source row positions by trace id
fn index_ids(ids: &[Option<TraceId>]) -> HashMap<&str, Vec<usize>> {
    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (position, id) in ids.iter().enumerate() {
        if let Some(id) = id {
            index.entry(id.as_str()).or_default().push(position);
        }
    }
    index
}

fn pair_by_trace_id(source_ids: &[Option<TraceId>], target_ids: &[Option<TraceId>]) -> Pairing {
    let index = index_ids(source_ids);
    let mut pairing = Pairing { pairs: Vec::new(), unmatched: 0 };

    for target_id in target_ids {
        let Some(target_id) = target_id else {
            pairing.unmatched += 1;
            continue;
        };
        match index.get(target_id.as_str()) {
            Some(positions) => {
                for &position in positions {
                    if let Some(source_id) = &source_ids[position] {
                        pairing.pairs.push((source_id.clone(), target_id.clone()));
                    }
                }
            }
            None => pairing.unmatched += 1,
        }
    }

    pairing
}

fn pair_by_tokens(
    target: Side<'_>,
    source_ids: &[Option<TraceId>],
    target_ids: &[Option<TraceId>],
) -> Pairing {
    let index = index_ids(source_ids);
    let mut pairing = Pairing { pairs: Vec::new(), unmatched: 0 };

    for (row, target_id) in target.rows.iter().zip(target_ids) {
        let Some(target_id) = target_id else {
            pairing.unmatched += 1;
            continue;
        };

        let mut matched = false;
        for token in row.parent_tokens().unwrap_or_default() {
            // `alias:trace_id`; the alias is informational
            let id = token.rsplit(':').next().unwrap_or(token.as_str()).trim();
            if let Some(positions) = index.get(id) {
                for &position in positions {
                    if let Some(source_id) = &source_ids[position] {
                        pairing.pairs.push((source_id.clone(), target_id.clone()));
                        matched = true;
                    }
                }
            }
        }

        if !matched {
            pairing.unmatched += 1;
        }
    }

    pairing
}

fn pair_by_columns(
    source: Side<'_>,
    target: Side<'_>,
    source_keys: &[String],
    target_keys: &[String],
    source_ids: &[Option<TraceId>],
    target_ids: &[Option<TraceId>],
) -> Result<Pairing, CaptureError> {
    let target_keys = if target_keys.is_empty() { source_keys } else { target_keys };

    if source_keys.is_empty() || source_keys.len() != target_keys.len() {
        return Err(CaptureError::InvalidCorrespondence {
            target_model: target.model.to_string(),
            reason: format!(
                "{} source key columns vs {} target key columns",
                source_keys.len(),
                target_keys.len()
            ),
        });
    }

    check_columns(source, source_keys)?;
    check_columns(target, target_keys)?;

    let mut index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (position, row) in source.rows.iter().enumerate() {
        if source_ids[position].is_none() {
            continue;
        }
        if let Some(key) = row_key(row, source_keys) {
            index.entry(key).or_default().push(position);
        }
    }

    let mut pairing = Pairing { pairs: Vec::new(), unmatched: 0 };
    for (row, target_id) in target.rows.iter().zip(target_ids) {
        let matches = target_id
            .as_ref()
            .and_then(|id| row_key(row, target_keys).map(|key| (id, key)))
            .and_then(|(id, key)| index.get(&key).map(|positions| (id, positions)));

        match matches {
            Some((target_id, positions)) => {
                for &position in positions {
                    if let Some(source_id) = &source_ids[position] {
                        pairing.pairs.push((source_id.clone(), target_id.clone()));
                    }
                }
            }
            None => pairing.unmatched += 1,
        }
    }

    Ok(pairing)
}

fn check_columns(side: Side<'_>, columns: &[String]) -> Result<(), CaptureError> {
    for row in side.rows {
        for column in columns {
            if !row.has_column(column) {
                return Err(CaptureError::MissingKeyColumn {
                    model: side.model.to_string(),
                    column: column.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Canonical key of a row; None when any key value is null or not
/// canonicalizable (null keys never match)
fn row_key(row: &Row, columns: &[String]) -> Option<Vec<String>> {
    columns
        .iter()
        .map(|column| {
            let value = row.get(column)?;
            if value.is_null() {
                return None;
            }
            canonical_value(column, value).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowlineage_core::{Severity, Value, PARENT_TRACE_COLUMN, TRACE_COLUMN};
    use serde_json::json;

    fn traced(id: &str, value: i64) -> Row {
        Row::new().with(TRACE_COLUMN, id).with("v", value)
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        let outcome = RowPairCapturer::new()
            .capture(Side::new("a", &[]), Side::new("b", &[]), "select 1")
            .unwrap();
        assert!(outcome.is_empty());
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.unmatched_targets, 0);
    }

    #[test]
    fn trace_id_pass_through() {
        let source = vec![traced("s1", 1), traced("s2", 2), traced("s3", 3)];
        let target = vec![traced("s3", 3), traced("s1", 1)];

        let outcome = RowPairCapturer::new()
            .capture(Side::new("stg", &source), Side::new("filtered", &target), "select * from stg")
            .unwrap();

        let pairs: Vec<(&str, &str)> = outcome
            .records
            .iter()
            .map(|r| (r.source_trace_id.as_str(), r.target_trace_id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("s3", "s3"), ("s1", "s1")]);
        assert!(outcome.records.iter().all(|r| r.executed_at == outcome.executed_at));
        assert!(outcome.records.iter().all(|r| r.compiled_sql == "select * from stg"));
    }

    #[test]
    fn fan_in_by_tokens() {
        let source: Vec<Row> = (1..=4).map(|i| traced(&format!("uuid{}", i), i)).collect();
        let target = vec![Row::new()
            .with(TRACE_COLUMN, "uuid_target")
            .with("count", 4i64)
            .with(
                PARENT_TRACE_COLUMN,
                Value::Json(json!(["stg:uuid1", "stg:uuid2", "stg:uuid3", "stg:uuid4"])),
            )];

        let outcome = RowPairCapturer::new()
            .capture(Side::new("stg", &source), Side::new("counts", &target), "select count(*)")
            .unwrap();

        assert_eq!(outcome.records.len(), 4);
        assert!(outcome.records.iter().all(|r| r.target_trace_id.as_str() == "uuid_target"));
        let mut sources: Vec<&str> = outcome.records.iter().map(|r| r.source_trace_id.as_str()).collect();
        sources.sort();
        assert_eq!(sources, vec!["uuid1", "uuid2", "uuid3", "uuid4"]);
    }

    #[test]
    fn join_tokens_only_match_their_upstream() {
        let target = vec![Row::new()
            .with(TRACE_COLUMN, "uuid_join")
            .with(PARENT_TRACE_COLUMN, Value::Json(json!(["model_a:uuidA", "model_b:uuidB"])))];

        let capturer = RowPairCapturer::new();
        let a = capturer
            .capture(Side::new("model_a", &[traced("uuidA", 1)]), Side::new("join", &target), "")
            .unwrap();
        let b = capturer
            .capture(Side::new("model_b", &[traced("uuidB", 1)]), Side::new("join", &target), "")
            .unwrap();

        assert_eq!(a.records.len(), 1);
        assert_eq!(a.records[0].source_trace_id.as_str(), "uuidA");
        assert_eq!(b.records.len(), 1);
        assert_eq!(b.records[0].source_trace_id.as_str(), "uuidB");
    }

    #[test]
    fn fan_in_by_business_key() {
        let source = vec![
            Row::new().with("region", "west").with("amount", 10i64),
            Row::new().with("region", "west").with("amount", 20i64),
            Row::new().with("region", "east").with("amount", 5i64),
        ];
        let target = vec![
            Row::new().with(TRACE_COLUMN, "agg_west").with("region", "west").with("total", 30i64),
            Row::new().with(TRACE_COLUMN, "agg_north").with("region", "north").with("total", 0i64),
        ];

        let outcome = RowPairCapturer::new()
            .capture_with(
                Side::new("orders", &source),
                Side::new("region_rollup", &target),
                "select region, sum(amount)",
                &Correspondence::Columns {
                    source: vec!["region".to_string()],
                    target: vec![],
                },
            )
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records.iter().all(|r| r.target_trace_id.as_str() == "agg_west"));
        assert_ne!(outcome.records[0].source_trace_id, outcome.records[1].source_trace_id);
        assert_eq!(outcome.unmatched_targets, 1);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].code, DiagnosticCode::UntracedTargetRow);
        assert_eq!(outcome.diagnostics[0].severity, Severity::Info);
    }

    #[test]
    fn null_keys_never_match() {
        let source = vec![Row::new().with("k", Value::Null).with("v", 1i64)];
        let target = vec![Row::new().with("k", Value::Null).with("w", 2i64)];

        let outcome = RowPairCapturer::new()
            .capture_with(
                Side::new("a", &source),
                Side::new("b", &target),
                "",
                &Correspondence::Columns { source: vec!["k".to_string()], target: vec![] },
            )
            .unwrap();
        assert!(outcome.is_empty());
        assert_eq!(outcome.unmatched_targets, 1);
    }

    #[test]
    fn missing_key_column_fails() {
        let source = vec![Row::new().with("id", 1i64)];
        let target = vec![Row::new().with("other", 1i64)];

        let err = RowPairCapturer::new()
            .capture_with(
                Side::new("a", &source),
                Side::new("b", &target),
                "",
                &Correspondence::Columns { source: vec!["id".to_string()], target: vec![] },
            )
            .unwrap_err();
        assert_eq!(
            err,
            CaptureError::MissingKeyColumn { model: "b".to_string(), column: "id".to_string() }
        );
    }

    #[test]
    fn duplicates_are_kept_and_reported() {
        let source = vec![traced("dup", 1), traced("dup", 1)];
        let target = vec![traced("dup", 1)];

        let outcome = RowPairCapturer::new()
            .capture(Side::new("a", &source), Side::new("b", &target), "")
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        let warnings: Vec<_> = outcome
            .diagnostics
            .iter()
            .filter(|d| d.code == DiagnosticCode::DuplicateTraceId)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warn);
        assert_eq!(warnings[0].detail.as_deref(), Some("dup"));
    }

    #[test]
    fn underivable_rows_are_reported() {
        let source = vec![Row::new().with(
            "shape",
            Value::Unsupported { type_name: "geometry".to_string() },
        )];
        let target = vec![traced("t", 1)];

        let outcome = RowPairCapturer::new()
            .capture(Side::new("a", &source), Side::new("b", &target), "")
            .unwrap();
        assert!(outcome.is_empty());
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::CaptureFailed && d.severity == Severity::Error));
    }
}
