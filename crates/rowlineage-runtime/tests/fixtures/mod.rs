//! Test fixtures for run orchestration tests
//!
//! Small dbt-shaped projects: a seed feeding a renaming model, a fan-out from
//! one staging model, and a project with a failing branch.

use rowlineage_core::{
    CorrespondenceRule, CorrespondenceStrategy, LineageConfig, Row, TRACE_COLUMN,
};
use rowlineage_dbt::{DependencyGraph, ModelNode};
use rowlineage_engine::derive;

pub const UPPER_SQL: &str = "select id, upper(name) as name_upper from raw_customers";

/// Config pairing `*_upper` models with their upstream on `id`
pub fn keyed_config() -> LineageConfig {
    LineageConfig {
        correspondence: vec![CorrespondenceRule {
            models: vec!["*_upper".to_string()],
            strategy: CorrespondenceStrategy::Columns,
            source: vec!["id".to_string()],
            target: vec![],
        }],
        ..Default::default()
    }
}

/// raw_customers (seed) -> customers_upper
pub fn customers_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph.add_model(ModelNode::seed("raw_customers")).unwrap();
    graph
        .add_model(
            ModelNode::new("customers_upper")
                .with_sql(UPPER_SQL)
                .with_upstream("raw_customers"),
        )
        .unwrap();
    graph
}

pub fn ann() -> Row {
    Row::new().with("id", 1i64).with("name", "ann")
}

pub fn customer(id: i64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

/// Same row with its derived trace id, as a seed reads after tracing
pub fn traced(row: Row) -> Row {
    let id = derive(&row).unwrap();
    row.with(TRACE_COLUMN, id.into_string())
}

/// stg -> {a, b}, both filtering pass-throughs
pub fn fan_out_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph.add_model(ModelNode::seed("stg")).unwrap();
    graph
        .add_model(ModelNode::new("a").with_sql("select * from stg").with_upstream("stg"))
        .unwrap();
    graph
        .add_model(
            ModelNode::new("b")
                .with_sql("select * from stg where id > 1")
                .with_upstream("stg"),
        )
        .unwrap();
    graph
}

/// raw -> stg -> mart_upper, raw -> broken -> broken_child
pub fn project_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph.add_model(ModelNode::seed("raw")).unwrap();
    graph
        .add_model(
            ModelNode::new("stg")
                .with_sql("select * from raw where id > 0")
                .with_upstream("raw"),
        )
        .unwrap();
    graph
        .add_model(
            ModelNode::new("mart_upper")
                .with_sql("select id, upper(name) as name_upper from stg")
                .with_upstream("stg"),
        )
        .unwrap();
    graph
        .add_model(
            ModelNode::new("broken")
                .with_sql("select id from raw")
                .with_upstream("raw"),
        )
        .unwrap();
    graph
        .add_model(
            ModelNode::new("broken_child")
                .with_sql("select id from broken")
                .with_upstream("broken"),
        )
        .unwrap();
    graph
}
