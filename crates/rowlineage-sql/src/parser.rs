//! SQL parsing using datafusion-sqlparser-rs
//!
//! Parses compiled model SQL into an AST and turns parser failures into
//! diagnostics.

use rowlineage_core::{DialectConfig, Diagnostic, DiagnosticCode, Severity};
use sqlparser::ast::{Expr, Statement};
use sqlparser::dialect::{BigQueryDialect, Dialect, GenericDialect, PostgreSqlDialect, SnowflakeDialect};
use sqlparser::parser::{Parser, ParserError};

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect>,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
        }
    }

    /// Create a SQL parser for BigQuery
    pub fn bigquery() -> Self {
        Self {
            dialect: Box::new(BigQueryDialect {}),
        }
    }

    /// Create a SQL parser for PostgreSQL
    pub fn postgres() -> Self {
        Self {
            dialect: Box::new(PostgreSqlDialect {}),
        }
    }

    /// Create a SQL parser for Snowflake
    pub fn snowflake() -> Self {
        Self {
            dialect: Box::new(SnowflakeDialect {}),
        }
    }

    /// Create a parser from a dialect config
    pub fn from_dialect(dialect: &DialectConfig) -> Self {
        match dialect {
            DialectConfig::BigQuery => Self::bigquery(),
            DialectConfig::Snowflake => Self::snowflake(),
            DialectConfig::Postgres => Self::postgres(),
            DialectConfig::Ansi => Self::new(),
        }
    }

    /// Parse SQL string into statements
    pub fn parse(&self, sql: &str) -> Result<ParsedSql, ParseError> {
        Parser::parse_sql(&*self.dialect, sql)
            .map(|statements| ParsedSql {
                sql: sql.to_string(),
                statements,
            })
            .map_err(|error| ParseError {
                sql: sql.to_string(),
                error,
            })
    }

    /// Parse a standalone expression (used for generated trace expressions)
    pub fn parse_expr(&self, expr: &str) -> Result<Expr, ParseError> {
        Parser::new(&*self.dialect)
            .try_with_sql(expr)
            .and_then(|mut parser| parser.parse_expr())
            .map_err(|error| ParseError {
                sql: expr.to_string(),
                error,
            })
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Successfully parsed SQL with AST
#[derive(Debug, Clone)]
pub struct ParsedSql {
    /// Original SQL string
    pub sql: String,

    /// Parsed statements
    pub statements: Vec<Statement>,
}

impl ParsedSql {
    pub fn first_statement(&self) -> Option<&Statement> {
        self.statements.first()
    }
}

/// Leading keyword of a statement (`INSERT`, `CREATE`, ...)
pub fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

/// SQL parsing error with the offending text
#[derive(Debug)]
pub struct ParseError {
    /// Original SQL string
    pub sql: String,

    /// Parser error from sqlparser
    pub error: ParserError,
}

impl ParseError {
    /// Convert to a diagnostic for the given model
    pub fn to_diagnostic(&self, model: &str) -> Diagnostic {
        Diagnostic::new(
            DiagnosticCode::InjectionFailed,
            Severity::Error,
            format!("Failed to parse SQL: {}", self.error),
        )
        .with_model(model)
        .with_detail(self.sql.clone())
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SQL parse error: {}", self.error)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_select() {
        let parser = SqlParser::new();
        let parsed = parser.parse("SELECT id, name FROM users WHERE active = true").unwrap();
        assert_eq!(parsed.statements.len(), 1);
        assert!(matches!(parsed.first_statement(), Some(Statement::Query(_))));
    }

    #[test]
    fn parse_with_cte_and_comments() {
        let parser = SqlParser::new();
        let sql = r#"
            -- staging
            WITH active_users AS (
                SELECT * FROM users WHERE active = true
            )
            /* final */
            SELECT id, name FROM active_users
        "#;

        let parsed = parser.parse(sql).unwrap();
        assert!(matches!(parsed.first_statement(), Some(Statement::Query(_))));
    }

    #[test]
    fn parse_invalid_sql() {
        let parser = SqlParser::new();
        let error = parser.parse("SELECT FROM WHERE").unwrap_err();

        let diag = error.to_diagnostic("users");
        assert_eq!(diag.code, DiagnosticCode::InjectionFailed);
        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.model.as_deref(), Some("users"));
    }

    #[test]
    fn parse_expression() {
        let parser = SqlParser::postgres();
        let expr = parser.parse_expr("CAST(MD5(CONCAT_WS('|', a, b)) AS UUID)").unwrap();
        assert!(expr.to_string().contains("MD5"));
    }

    #[test]
    fn statement_kinds() {
        let parser = SqlParser::new();
        let parsed = parser.parse("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(statement_kind(parsed.first_statement().unwrap()), "INSERT");
    }

    #[test]
    fn different_dialects() {
        let sql = "SELECT id FROM users";
        for dialect in [
            DialectConfig::Ansi,
            DialectConfig::Postgres,
            DialectConfig::Snowflake,
            DialectConfig::BigQuery,
        ] {
            assert!(SqlParser::from_dialect(&dialect).parse(sql).is_ok());
        }
    }
}
