//! PostgreSQL backend for the table sink
//!
//! Works with PostgreSQL 9.5+ and compatible servers. Connections may be plain
//! or TLS (native-tls), following the `tls` flag of the connection config.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let table = PostgresTable::connect(&PostgresConnection {
//!     host: "localhost".to_string(),
//!     port: 5432,
//!     database: "analytics".to_string(),
//!     user: "dbt".to_string(),
//!     password: Some("secret".to_string()),
//!     tls: false,
//!     schema: Some("lineage".to_string()),
//! }).await?;
//! let writer = TableWriter::new(table);
//! ```

use crate::table::{TableBackend, MAPPING_TABLE};
use crate::writer::ExportError;
use async_trait::async_trait;
use rowlineage_core::{LineageMapping, PostgresConnection};

#[cfg(feature = "postgres")]
use crate::table::create_table_sql;

#[cfg(feature = "postgres")]
use rowlineage_core::TraceId;

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(feature = "postgres")]
use tracing::error;

#[cfg(not(feature = "postgres"))]
const NOT_COMPILED: &str =
    "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres";

/// Open a client for `conn`, spawning its connection task
#[cfg(feature = "postgres")]
pub async fn connect_client(conn: &PostgresConnection) -> Result<Client, ExportError> {
    let config = conn.connection_string();
    let destination = format!("postgres://{}:{}/{}", conn.host, conn.port, conn.database);

    let client = if conn.tls {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| ExportError::Config(format!("Failed to create TLS connector: {}", e)))?;

        let (client, connection) = tokio_postgres::connect(&config, MakeTlsConnector::new(connector))
            .await
            .map_err(|e| ExportError::unavailable(&destination, e))?;

        let target = destination.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(destination = %target, error = %e, "PostgreSQL TLS connection error");
            }
        });
        client
    } else {
        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|e| ExportError::unavailable(&destination, e))?;

        let target = destination.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(destination = %target, error = %e, "PostgreSQL connection error");
            }
        });
        client
    };

    Ok(client)
}

/// Mapping table inside a PostgreSQL database
pub struct PostgresTable {
    #[cfg(feature = "postgres")]
    client: tokio::sync::Mutex<Client>,

    host: String,
    port: u16,
    database: String,
    schema: Option<String>,
}

impl PostgresTable {
    /// Connect with the given descriptor
    #[cfg(feature = "postgres")]
    pub async fn connect(conn: &PostgresConnection) -> Result<Self, ExportError> {
        let client = connect_client(conn).await?;
        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            host: conn.host.clone(),
            port: conn.port,
            database: conn.database.clone(),
            schema: conn.schema.clone(),
        })
    }

    /// Connect (returns error without the postgres feature)
    #[cfg(not(feature = "postgres"))]
    pub async fn connect(_conn: &PostgresConnection) -> Result<Self, ExportError> {
        Err(ExportError::Config(NOT_COMPILED.to_string()))
    }

    fn destination(&self) -> String {
        format!("postgres://{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Schema-qualified, quoted table name
pub fn qualified_table(schema: Option<&str>) -> String {
    match schema {
        Some(schema) => format!("\"{}\".{}", schema.replace('"', "\"\""), MAPPING_TABLE),
        None => MAPPING_TABLE.to_string(),
    }
}

#[async_trait]
impl TableBackend for PostgresTable {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn table(&self) -> String {
        qualified_table(self.schema.as_deref())
    }

    #[cfg(feature = "postgres")]
    async fn ensure_table(&self) -> Result<(), ExportError> {
        let client = self.client.lock().await;
        if let Some(schema) = &self.schema {
            client
                .batch_execute(&format!(
                    "CREATE SCHEMA IF NOT EXISTS \"{}\"",
                    schema.replace('"', "\"\"")
                ))
                .await
                .map_err(|e| ExportError::unavailable(self.destination(), e))?;
        }
        client
            .batch_execute(&create_table_sql(&self.table(), "TIMESTAMPTZ"))
            .await
            .map_err(|e| ExportError::unavailable(self.destination(), e))
    }

    #[cfg(not(feature = "postgres"))]
    async fn ensure_table(&self) -> Result<(), ExportError> {
        Err(ExportError::unavailable(self.destination(), NOT_COMPILED))
    }

    #[cfg(feature = "postgres")]
    async fn insert(&self, records: &[LineageMapping]) -> Result<usize, ExportError> {
        let destination = self.destination();
        let mut client = self.client.lock().await;

        let tx = client
            .transaction()
            .await
            .map_err(|e| ExportError::unavailable(&destination, e))?;
        let stmt = tx
            .prepare(&format!(
                "INSERT INTO {} (source_model, target_model, source_trace_id, target_trace_id, compiled_sql, executed_at) VALUES ($1, $2, $3, $4, $5, $6)",
                self.table()
            ))
            .await
            .map_err(|e| ExportError::write_failed(&destination, e))?;

        for record in records {
            tx.execute(
                &stmt,
                &[
                    &record.source_model,
                    &record.target_model,
                    &record.source_trace_id.as_str(),
                    &record.target_trace_id.as_str(),
                    &record.compiled_sql,
                    &record.executed_at,
                ],
            )
            .await
            .map_err(|e| ExportError::write_failed(&destination, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| ExportError::write_failed(&destination, e))?;
        Ok(records.len())
    }

    #[cfg(not(feature = "postgres"))]
    async fn insert(&self, _records: &[LineageMapping]) -> Result<usize, ExportError> {
        Err(ExportError::unavailable(self.destination(), NOT_COMPILED))
    }

    #[cfg(feature = "postgres")]
    async fn select_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        let destination = self.destination();
        let client = self.client.lock().await;

        let rows = client
            .query(
                &format!(
                    "SELECT source_model, target_model, source_trace_id, target_trace_id, compiled_sql, executed_at FROM {} ORDER BY executed_at, target_model, target_trace_id",
                    self.table()
                ),
                &[],
            )
            .await
            .map_err(|e| ExportError::read_failed(&destination, e))?;

        rows.iter()
            .map(|row| {
                let text = |i: usize| {
                    row.try_get::<_, String>(i)
                        .map_err(|e| ExportError::read_failed(&destination, e))
                };
                Ok(LineageMapping {
                    source_model: text(0)?,
                    target_model: text(1)?,
                    source_trace_id: TraceId::new(text(2)?),
                    target_trace_id: TraceId::new(text(3)?),
                    compiled_sql: text(4)?,
                    executed_at: row
                        .try_get(5)
                        .map_err(|e| ExportError::read_failed(&destination, e))?,
                })
            })
            .collect()
    }

    #[cfg(not(feature = "postgres"))]
    async fn select_all(&self) -> Result<Vec<LineageMapping>, ExportError> {
        Err(ExportError::read_failed(self.destination(), NOT_COMPILED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_quoted_per_schema() {
        assert_eq!(qualified_table(None), "lineage__mappings");
        assert_eq!(qualified_table(Some("lineage")), "\"lineage\".lineage__mappings");
        assert_eq!(qualified_table(Some("we\"ird")), "\"we\"\"ird\".lineage__mappings");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn connect_without_feature_fails() {
        let conn = PostgresConnection {
            host: "localhost".to_string(),
            port: 5432,
            database: "analytics".to_string(),
            user: "dbt".to_string(),
            password: None,
            tls: false,
            schema: None,
        };
        let err = PostgresTable::connect(&conn).await.err().unwrap();
        assert!(matches!(err, ExportError::Config(_)));
    }
}
