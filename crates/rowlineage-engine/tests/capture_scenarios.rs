//! Pairing scenarios across the deriver and the capturer

use pretty_assertions::assert_eq;
use rowlineage_core::{Correspondence, DiagnosticCode, Row, Value, PARENT_TRACE_COLUMN, TRACE_COLUMN};
use rowlineage_engine::{derive, is_derived, RowPairCapturer, Side};
use std::collections::BTreeSet;

fn customers() -> Vec<Row> {
    vec![Row::new().with("id", 1i64).with("name", "ann")]
}

#[test]
fn ann_is_paired_on_id() {
    let source = customers();
    let target = vec![Row::new()
        .with(TRACE_COLUMN, "7d3c2f4e-0000-4000-8000-000000000001")
        .with("id", 1i64)
        .with("name_upper", "ANN")];
    let sql = "SELECT CAST(MD5(...) AS UUID) AS _row_trace_id, id, upper(name) AS name_upper FROM raw_customers";

    let outcome = RowPairCapturer::new()
        .capture_with(
            Side::new("raw_customers", &source),
            Side::new("customers_upper", &target),
            sql,
            &Correspondence::Columns { source: vec!["id".to_string()], target: vec![] },
        )
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    let record = &outcome.records[0];
    assert_eq!(record.source_model, "raw_customers");
    assert_eq!(record.target_model, "customers_upper");
    assert_eq!(record.source_trace_id, derive(&source[0]).unwrap());
    assert_eq!(record.target_trace_id.as_str(), "7d3c2f4e-0000-4000-8000-000000000001");
    assert_eq!(record.compiled_sql, sql);
    assert!(is_derived(record.source_trace_id.as_str()));
}

#[test]
fn fan_in_yields_one_record_per_source_row() {
    let n = 25;
    let source: Vec<Row> = (0..n).map(|i| Row::new().with("order_id", i as i64).with("region", "west")).collect();
    let source_ids: Vec<String> = source.iter().map(|row| derive(row).unwrap().into_string()).collect();

    let tokens = source_ids
        .iter()
        .map(|id| serde_json::Value::String(format!("orders:{}", id)))
        .collect();
    let target = vec![Row::new()
        .with(TRACE_COLUMN, "west-total")
        .with("region", "west")
        .with("orders", n as i64)
        .with(PARENT_TRACE_COLUMN, Value::Json(serde_json::Value::Array(tokens)))];

    let outcome = RowPairCapturer::new()
        .capture(Side::new("orders", &source), Side::new("region_totals", &target), "select ...")
        .unwrap();

    assert_eq!(outcome.records.len(), n);
    let targets: BTreeSet<&str> = outcome.records.iter().map(|r| r.target_trace_id.as_str()).collect();
    assert_eq!(targets.len(), 1);
    let sources: BTreeSet<String> = outcome.records.iter().map(|r| r.source_trace_id.to_string()).collect();
    assert_eq!(sources, source_ids.into_iter().collect::<BTreeSet<_>>());
}

#[test]
fn fan_in_by_key_matches_token_result() {
    let source: Vec<Row> = (0..6).map(|i| Row::new().with("id", i as i64).with("region", if i % 2 == 0 { "east" } else { "west" })).collect();
    let target = vec![
        Row::new().with(TRACE_COLUMN, "east").with("region", "east"),
        Row::new().with(TRACE_COLUMN, "west").with("region", "west"),
    ];

    let outcome = RowPairCapturer::new()
        .capture_with(
            Side::new("orders", &source),
            Side::new("by_region", &target),
            "",
            &Correspondence::Columns { source: vec!["region".to_string()], target: vec!["region".to_string()] },
        )
        .unwrap();

    let east = outcome.records.iter().filter(|r| r.target_trace_id.as_str() == "east").count();
    let west = outcome.records.iter().filter(|r| r.target_trace_id.as_str() == "west").count();
    assert_eq!((east, west), (3, 3));
    // Target order first
    assert_eq!(outcome.records[0].target_trace_id.as_str(), "east");
    assert_eq!(outcome.records[5].target_trace_id.as_str(), "west");
}

#[test]
fn untraced_pass_through_pairs_on_derived_ids() {
    // Both sides lack the trace column; identical content derives identical ids
    let source = vec![
        Row::new().with("id", 1i64).with("status", "shipped"),
        Row::new().with("id", 2i64).with("status", "returned"),
    ];
    let target = vec![source[0].clone()];

    let outcome = RowPairCapturer::new()
        .capture(Side::new("stg_orders", &source), Side::new("shipped", &target), "select * from stg_orders")
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].source_trace_id, outcome.records[0].target_trace_id);
    assert_eq!(outcome.unmatched_targets, 0);
}

#[test]
fn unmatched_targets_do_not_fail() {
    let source = vec![Row::new().with(TRACE_COLUMN, "a").with("v", 1i64)];
    let target = vec![
        Row::new().with(TRACE_COLUMN, "b").with("v", 2i64),
        Row::new().with(TRACE_COLUMN, "c").with("v", 3i64),
    ];

    let outcome = RowPairCapturer::new()
        .capture(Side::new("up", &source), Side::new("down", &target), "")
        .unwrap();

    assert!(outcome.is_empty());
    assert_eq!(outcome.unmatched_targets, 2);
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].code, DiagnosticCode::UntracedTargetRow);
}

#[test]
fn empty_sides_produce_nothing() {
    let rows = customers();
    let capturer = RowPairCapturer::new();

    let no_source = capturer.capture(Side::new("a", &[]), Side::new("b", &rows), "").unwrap();
    assert!(no_source.is_empty());

    let no_target = capturer.capture(Side::new("a", &rows), Side::new("b", &[]), "").unwrap();
    assert!(no_target.is_empty());
    assert!(no_target.diagnostics.is_empty());
}

#[test]
fn duplicate_targets_emit_per_occurrence() {
    let source = vec![Row::new().with(TRACE_COLUMN, "s").with("v", 1i64)];
    let target = vec![
        Row::new().with(TRACE_COLUMN, "s").with("v", 1i64),
        Row::new().with(TRACE_COLUMN, "s").with("v", 1i64),
    ];

    let outcome = RowPairCapturer::new()
        .capture(Side::new("up", &source), Side::new("down", &target), "")
        .unwrap();

    assert_eq!(outcome.records.len(), 2);
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::DuplicateTraceId && d.model.as_deref() == Some("down")));
}
