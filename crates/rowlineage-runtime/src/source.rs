//! Row sources: where the project capture reads materialized rows from
//!
//! A host that drives models itself hands rows to the lifecycle hooks
//! directly. [`capture_lineage_for_project`](crate::capture_lineage_for_project)
//! instead runs each model's instrumented SQL against a [`RowSource`].

use crate::error::SourceError;
use async_trait::async_trait;
use rowlineage_core::{Row, TRACE_COLUMN};
use rowlineage_dbt::ModelNode;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// A warehouse (or stand-in) that can run model SQL and read relations
#[async_trait]
pub trait RowSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a model's instrumented SELECT and return its rows
    async fn query(&self, model: &ModelNode, sql: &str) -> Result<Vec<Row>, SourceError>;

    /// Read every row of a materialized relation (seeds)
    async fn fetch_relation(&self, model: &ModelNode) -> Result<Vec<Row>, SourceError>;

    /// Make sure a relation carries a trace column
    ///
    /// Seeds are loaded without one; rows get an id derived from their content.
    async fn ensure_trace_column(&self, model: &ModelNode) -> Result<(), SourceError>;
}

/// In-memory source keyed by model name
///
/// Query results are canned per model; the SQL each model was queried with is
/// kept for inspection.
#[derive(Default)]
pub struct MemorySource {
    relations: Mutex<HashMap<String, Vec<Row>>>,
    results: HashMap<String, Vec<Row>>,
    failures: HashMap<String, String>,
    queried: Mutex<Vec<(String, String)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of a materialized relation
    pub fn with_relation(self, model: impl Into<String>, rows: Vec<Row>) -> Self {
        self.relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.into(), rows);
        self
    }

    /// Rows returned when a model's SQL is queried
    pub fn with_result(mut self, model: impl Into<String>, rows: Vec<Row>) -> Self {
        self.results.insert(model.into(), rows);
        self
    }

    /// Make a model's query fail
    pub fn with_failure(mut self, model: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.insert(model.into(), reason.into());
        self
    }

    /// `(model, sql)` of every query, in call order
    pub fn queried(&self) -> Vec<(String, String)> {
        self.queried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current rows of a relation
    pub fn relation(&self, model: &str) -> Option<Vec<Row>> {
        self.relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .cloned()
    }
}

#[async_trait]
impl RowSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, model: &ModelNode, sql: &str) -> Result<Vec<Row>, SourceError> {
        self.queried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((model.name.clone(), sql.to_string()));

        if let Some(reason) = self.failures.get(&model.name) {
            return Err(SourceError::Query {
                model: model.name.clone(),
                sql: sql.to_string(),
                reason: reason.clone(),
            });
        }

        Ok(self.results.get(&model.name).cloned().unwrap_or_default())
    }

    async fn fetch_relation(&self, model: &ModelNode) -> Result<Vec<Row>, SourceError> {
        self.relation(&model.name).ok_or_else(|| SourceError::Relation {
            relation: model.name.clone(),
            reason: "relation does not exist".to_string(),
        })
    }

    async fn ensure_trace_column(&self, model: &ModelNode) -> Result<(), SourceError> {
        let mut relations = self.relations.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = relations.get_mut(&model.name) else {
            return Err(SourceError::Relation {
                relation: model.name.clone(),
                reason: "relation does not exist".to_string(),
            });
        };

        for row in rows.iter_mut().filter(|row| !row.has_column(TRACE_COLUMN)) {
            let id = rowlineage_engine::derive(row).map_err(|e| SourceError::Relation {
                relation: model.name.clone(),
                reason: e.to_string(),
            })?;
            row.push(TRACE_COLUMN, id.into_string());
        }
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresSource;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use rowlineage_core::{PostgresConnection, Value};
    use rowlineage_sql::TraceExpression;
    use tokio_postgres::types::Type;
    use tokio_postgres::Client;
    use tracing::{debug, info};

    /// Rows read from a PostgreSQL warehouse
    pub struct PostgresSource {
        client: Client,
        expression: TraceExpression,
    }

    impl PostgresSource {
        pub async fn connect(
            conn: &PostgresConnection,
            expression: TraceExpression,
        ) -> Result<Self, SourceError> {
            let client = rowlineage_export::postgres::connect_client(conn)
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            Ok(Self { client, expression })
        }
    }

    fn quote(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn relation_name(model: &ModelNode) -> Result<(String, String, String), SourceError> {
        let (schema, table) = model.relation().map_err(|e| SourceError::Relation {
            relation: model.name.clone(),
            reason: e.to_string(),
        })?;
        let qualified = format!("{}.{}", quote(&schema), quote(&table));
        Ok((schema, table, qualified))
    }

    fn to_value(row: &tokio_postgres::Row, i: usize) -> Result<Value, tokio_postgres::Error> {
        let ty = row.columns()[i].type_();

        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)?.into()
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)?.map(i64::from).into()
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)?.map(i64::from).into()
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)?.into()
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)?.map(f64::from).into()
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)?.into()
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<rust_decimal::Decimal>>(i)?.into()
        } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
            row.try_get::<_, Option<String>>(i)?.into()
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<uuid::Uuid>>(i)?
                .map(|id| id.to_string())
                .into()
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(i)?
                .map_or(Value::Null, Value::Date)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(i)?
                .map_or(Value::Null, |ts| Value::Timestamp(ts.and_utc()))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)?
                .map_or(Value::Null, Value::Timestamp)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(i)?
                .map_or(Value::Null, Value::Bytes)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(i)?
                .map_or(Value::Null, Value::Json)
        } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
            row.try_get::<_, Option<Vec<Option<String>>>>(i)?
                .map_or(Value::Null, |items| Value::Json(serde_json::json!(items)))
        } else {
            Value::Unsupported {
                type_name: ty.name().to_string(),
            }
        };

        Ok(value)
    }

    fn to_row(row: &tokio_postgres::Row) -> Result<Row, tokio_postgres::Error> {
        let mut out = Row::new();
        for (i, column) in row.columns().iter().enumerate() {
            out.push(column.name(), to_value(row, i)?);
        }
        Ok(out)
    }

    #[async_trait]
    impl RowSource for PostgresSource {
        fn name(&self) -> &'static str {
            "postgres"
        }

        async fn query(&self, model: &ModelNode, sql: &str) -> Result<Vec<Row>, SourceError> {
            let failed = |e: tokio_postgres::Error| SourceError::Query {
                model: model.name.clone(),
                sql: sql.to_string(),
                reason: e.to_string(),
            };

            let rows = self.client.query(sql, &[]).await.map_err(failed)?;
            debug!(model = %model.name, rows = rows.len(), "Model queried");
            rows.iter().map(to_row).collect::<Result<_, _>>().map_err(failed)
        }

        async fn fetch_relation(&self, model: &ModelNode) -> Result<Vec<Row>, SourceError> {
            let (_, _, qualified) = relation_name(model)?;
            let failed = |e: tokio_postgres::Error| SourceError::Relation {
                relation: qualified.clone(),
                reason: e.to_string(),
            };

            let rows = self
                .client
                .query(&format!("SELECT * FROM {}", qualified), &[])
                .await
                .map_err(failed)?;
            rows.iter().map(to_row).collect::<Result<_, _>>().map_err(failed)
        }

        async fn ensure_trace_column(&self, model: &ModelNode) -> Result<(), SourceError> {
            let (schema, table, qualified) = relation_name(model)?;
            let failed = |e: tokio_postgres::Error| SourceError::Relation {
                relation: qualified.clone(),
                reason: e.to_string(),
            };

            let existing = self
                .client
                .query_opt(
                    "SELECT 1 FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
                    &[&schema, &table, &TRACE_COLUMN],
                )
                .await
                .map_err(failed)?;
            if existing.is_some() {
                return Ok(());
            }

            self.client
                .batch_execute(&format!(
                    "ALTER TABLE {} ADD COLUMN {} UUID",
                    qualified, TRACE_COLUMN
                ))
                .await
                .map_err(failed)?;
            let updated = self
                .client
                .execute(
                    &format!(
                        "UPDATE {} AS t SET {} = {}",
                        qualified,
                        TRACE_COLUMN,
                        self.expression.for_row("t")
                    ),
                    &[],
                )
                .await
                .map_err(failed)?;

            info!(relation = %qualified, rows = updated, "Trace column added");
            Ok(())
        }
    }
}
