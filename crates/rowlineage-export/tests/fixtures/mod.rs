//! Test fixtures for export sink integration tests
//!
//! Mapping batches shaped like real captures: a pass-through edge, a fan-in
//! aggregation and SQL text with characters every sink must preserve.

use chrono::{DateTime, TimeZone, Utc};
use rowlineage_core::{LineageMapping, TraceId};

/// Capture time shared by the fixture batches
pub fn executed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::microseconds(42)
}

fn mapping(source: &str, target: &str, source_id: &str, target_id: &str, sql: &str) -> LineageMapping {
    LineageMapping {
        source_model: source.to_string(),
        target_model: target.to_string(),
        source_trace_id: TraceId::new(source_id),
        target_trace_id: TraceId::new(target_id),
        compiled_sql: sql.to_string(),
        executed_at: executed_at(),
    }
}

/// stg_customers -> customers, one record per row
pub fn pass_through_batch() -> Vec<LineageMapping> {
    let sql = "select * from stg_customers where status <> 'deleted'";
    (1..=3)
        .map(|i| {
            let id = format!("00000000-0000-4000-8000-00000000000{}", i);
            mapping("stg_customers", "customers", &id, &id, sql)
        })
        .collect()
}

/// orders -> order_totals, four source rows into one target row
pub fn fan_in_batch() -> Vec<LineageMapping> {
    let sql = "select customer_id, sum(amount) as total\nfrom orders\ngroup by 1";
    (1..=4)
        .map(|i| {
            mapping(
                "orders",
                "order_totals",
                &format!("10000000-0000-4000-8000-00000000000{}", i),
                "20000000-0000-4000-8000-000000000001",
                sql,
            )
        })
        .collect()
}

/// A record whose SQL carries quotes, newlines, tabs and unicode
pub fn awkward_sql_record() -> LineageMapping {
    mapping(
        "raw_events",
        "events",
        "30000000-0000-4000-8000-000000000001",
        "30000000-0000-4000-8000-000000000002",
        "select 'it''s', \"Col\"\n\t, '→ ünïcode' -- trailing comment",
    )
}
