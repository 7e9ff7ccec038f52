//! Trace column injection
//!
//! Rewrites a compiled SELECT so that its outermost projection starts with
//! `<trace expression> AS _row_trace_id`. The rewrite is idempotent: a query
//! whose leftmost outer SELECT already projects the trace column is returned
//! byte for byte unchanged.
//!
//! Positional `ORDER BY n`, `GROUP BY n` and `DISTINCT ON (n)` references are
//! shifted by one so that they keep pointing at the same column after the
//! prepend.
//!
//! A projection calling a set-returning function (`unnest(tags)`) cannot be
//! fed to the trace expression, so such a query is wrapped instead:
//!
//! ```text
//! SELECT <trace expression over _row_trace_source> AS _row_trace_id, _row_trace_source.*
//! FROM (<query>) AS _row_trace_source
//! ```

use crate::dialect::TraceExpression;
use crate::parser::{statement_kind, ParseError, SqlParser};
use rowlineage_core::{DialectConfig, LineageConfig, WildcardPolicy, TRACE_COLUMN};
use sqlparser::ast::{
    Distinct, Expr, GroupByExpr, Ident, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    Value,
};
use tracing::debug;

/// What the injector did with a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectStatus {
    /// Trace expression prepended to every SELECT branch
    Injected,

    /// The query already projects the trace column
    AlreadyTraced,

    /// Wildcard projection left as-is; the trace column comes from upstream
    WildcardPassThrough,

    /// Query wrapped in a traced subquery; a projection returns a set
    Wrapped,
}

/// Alias of the subquery a wrapped statement reads from
pub const WRAPPED_RELATION: &str = "_row_trace_source";

/// Set-returning functions that are only valid as top-level projections
const SET_RETURNING_FUNCTIONS: &[&str] = &[
    "unnest",
    "generate_series",
    "generate_subscripts",
    "regexp_matches",
    "regexp_split_to_table",
    "string_to_table",
    "json_array_elements",
    "json_array_elements_text",
    "jsonb_array_elements",
    "jsonb_array_elements_text",
    "json_each",
    "json_each_text",
    "jsonb_each",
    "jsonb_each_text",
    "json_object_keys",
    "jsonb_object_keys",
    "jsonb_path_query",
    "json_populate_recordset",
    "jsonb_populate_recordset",
    "json_to_recordset",
    "jsonb_to_recordset",
];

/// Result of instrumenting one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrumented {
    pub sql: String,
    pub status: InjectStatus,
}

/// Injection errors
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Multiple statements are not supported (found {count})")]
    MultiStatementUnsupported { count: usize, sql: String },

    #[error("Not a SELECT statement: {kind}")]
    NotASelectStatement { kind: String, sql: String },

    #[error("Cannot resolve the relation behind a wildcard projection")]
    UnresolvableWildcard { sql: String },
}

impl InjectError {
    /// The SQL that could not be instrumented
    pub fn sql(&self) -> &str {
        match self {
            Self::Parse(e) => &e.sql,
            Self::MultiStatementUnsupported { sql, .. }
            | Self::NotASelectStatement { sql, .. }
            | Self::UnresolvableWildcard { sql } => sql,
        }
    }
}

/// Adds the trace column to compiled SELECT statements
///
/// Stateless: one injector can be shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct TraceInjector {
    dialect: DialectConfig,
    wildcard_policy: WildcardPolicy,
    expression: TraceExpression,
}

impl TraceInjector {
    pub fn new(dialect: DialectConfig, wildcard_policy: WildcardPolicy) -> Self {
        Self {
            dialect,
            wildcard_policy,
            expression: TraceExpression::new(dialect),
        }
    }

    pub fn from_config(config: &LineageConfig) -> Self {
        Self::new(config.dialect, config.wildcard_policy)
    }

    pub fn expression(&self) -> &TraceExpression {
        &self.expression
    }

    /// Instrumented SQL text
    pub fn inject(&self, sql: &str) -> Result<String, InjectError> {
        self.instrument(sql).map(|instrumented| instrumented.sql)
    }

    /// Instrument and report what was done
    pub fn instrument(&self, sql: &str) -> Result<Instrumented, InjectError> {
        let parser = SqlParser::from_dialect(&self.dialect);
        let mut statements = parser.parse(sql)?.statements;

        if statements.len() > 1 {
            return Err(InjectError::MultiStatementUnsupported {
                count: statements.len(),
                sql: sql.to_string(),
            });
        }

        let mut query = match statements.pop() {
            Some(Statement::Query(query)) => query,
            Some(other) => {
                return Err(InjectError::NotASelectStatement {
                    kind: statement_kind(&other),
                    sql: sql.to_string(),
                })
            }
            None => {
                return Err(InjectError::NotASelectStatement {
                    kind: "EMPTY".to_string(),
                    sql: sql.to_string(),
                })
            }
        };

        let outer = leftmost_select(&query.body).ok_or_else(|| InjectError::NotASelectStatement {
            kind: body_kind(&query.body).to_string(),
            sql: sql.to_string(),
        })?;

        if projects_trace_column(&outer.projection) {
            debug!("SQL already projects {}", TRACE_COLUMN);
            return Ok(Instrumented {
                sql: sql.to_string(),
                status: InjectStatus::AlreadyTraced,
            });
        }

        if self.wildcard_policy == WildcardPolicy::PassThrough && has_wildcard(&query.body) {
            debug!("Wildcard projection passed through");
            return Ok(Instrumented {
                sql: sql.to_string(),
                status: InjectStatus::WildcardPassThrough,
            });
        }

        if projects_set_returning(&query.body) {
            debug!("Set-returning projection, wrapping query");
            return Ok(Instrumented {
                sql: self.wrap(&query),
                status: InjectStatus::Wrapped,
            });
        }

        self.inject_query(&parser, &mut query, sql)?;

        Ok(Instrumented {
            sql: query.to_string(),
            status: InjectStatus::Injected,
        })
    }

    fn wrap(&self, query: &Query) -> String {
        format!(
            "SELECT {} AS {}, {relation}.* FROM ({}) AS {relation}",
            self.expression.for_row(WRAPPED_RELATION),
            TRACE_COLUMN,
            query,
            relation = WRAPPED_RELATION
        )
    }

    fn inject_query(&self, parser: &SqlParser, query: &mut Query, sql: &str) -> Result<(), InjectError> {
        self.inject_set_expr(parser, &mut query.body, sql)?;

        if let Some(order_by) = query.order_by.as_mut() {
            for item in order_by.exprs.iter_mut() {
                shift_position(&mut item.expr);
            }
        }

        Ok(())
    }

    fn inject_set_expr(&self, parser: &SqlParser, body: &mut SetExpr, sql: &str) -> Result<(), InjectError> {
        match body {
            SetExpr::Select(select) => self.inject_select(parser, select, sql),
            SetExpr::Query(query) => self.inject_query(parser, query, sql),
            SetExpr::SetOperation { left, right, .. } => {
                self.inject_set_expr(parser, left, sql)?;
                self.inject_set_expr(parser, right, sql)
            }
            other => Err(InjectError::NotASelectStatement {
                kind: body_kind(other).to_string(),
                sql: sql.to_string(),
            }),
        }
    }

    fn inject_select(&self, parser: &SqlParser, select: &mut Select, sql: &str) -> Result<(), InjectError> {
        if projects_trace_column(&select.projection) {
            return Ok(());
        }

        let parts = self.projection_parts(select, sql)?;
        let expr = parser.parse_expr(&self.expression.digest(&parts))?;

        select.projection.insert(
            0,
            SelectItem::ExprWithAlias {
                expr,
                alias: Ident::new(TRACE_COLUMN),
            },
        );

        if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            for expr in exprs.iter_mut() {
                shift_position(expr);
            }
        }

        if let Some(Distinct::On(exprs)) = &mut select.distinct {
            for expr in exprs.iter_mut() {
                shift_position(expr);
            }
        }

        Ok(())
    }

    /// Text parts hashed for one SELECT: one per projected expression, one
    /// whole-row part per relation covered by a wildcard
    fn projection_parts(&self, select: &Select, sql: &str) -> Result<Vec<String>, InjectError> {
        let mut parts = Vec::with_capacity(select.projection.len());

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    parts.push(self.expression.column_text(&expr.to_string()));
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let relation = name
                        .0
                        .last()
                        .map(|ident| ident.to_string())
                        .ok_or_else(|| InjectError::UnresolvableWildcard { sql: sql.to_string() })?;
                    parts.push(self.expression.row_text(&relation));
                }
                SelectItem::Wildcard(_) => {
                    let relations = relation_refs(select)
                        .filter(|relations| !relations.is_empty())
                        .ok_or_else(|| InjectError::UnresolvableWildcard { sql: sql.to_string() })?;
                    parts.extend(relations.iter().map(|r| self.expression.row_text(r)));
                }
            }
        }

        Ok(parts)
    }
}

impl Default for TraceInjector {
    fn default() -> Self {
        Self::new(DialectConfig::default(), WildcardPolicy::default())
    }
}

/// First SELECT reached by following left branches
fn leftmost_select(body: &SetExpr) -> Option<&Select> {
    match body {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(query) => leftmost_select(&query.body),
        SetExpr::SetOperation { left, .. } => leftmost_select(left),
        _ => None,
    }
}

fn body_kind(body: &SetExpr) -> &'static str {
    match body {
        SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::SetOperation { .. } => "SELECT",
        SetExpr::Values(_) => "VALUES",
        SetExpr::Insert(_) => "INSERT",
        SetExpr::Update(_) => "UPDATE",
        SetExpr::Table(_) => "TABLE",
        #[allow(unreachable_patterns)]
        _ => "UNKNOWN",
    }
}

fn projects_trace_column(projection: &[SelectItem]) -> bool {
    projection.iter().any(|item| match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.eq_ignore_ascii_case(TRACE_COLUMN),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => ident.value.eq_ignore_ascii_case(TRACE_COLUMN),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => idents
            .last()
            .is_some_and(|ident| ident.value.eq_ignore_ascii_case(TRACE_COLUMN)),
        _ => false,
    })
}

fn has_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _))
        }),
        SetExpr::Query(query) => has_wildcard(&query.body),
        SetExpr::SetOperation { left, right, .. } => has_wildcard(left) || has_wildcard(right),
        _ => false,
    }
}

fn projects_set_returning(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                calls_set_returning(&expr.to_string())
            }
            _ => false,
        }),
        SetExpr::Query(query) => projects_set_returning(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            projects_set_returning(left) || projects_set_returning(right)
        }
        _ => false,
    }
}

/// Whether rendered expression text calls a set-returning function
fn calls_set_returning(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    let bytes = text.as_bytes();

    SET_RETURNING_FUNCTIONS.iter().any(|name| {
        let call = format!("{}(", name);
        text.match_indices(&call).any(|(at, _)| {
            at == 0 || !(bytes[at - 1].is_ascii_alphanumeric() || bytes[at - 1] == b'_')
        })
    })
}

/// Alias (or bare table name) of every relation in FROM and JOIN clauses;
/// None when one of them cannot be referenced by name
fn relation_refs(select: &Select) -> Option<Vec<String>> {
    let mut relations = Vec::new();

    for table_with_joins in &select.from {
        let factors = std::iter::once(&table_with_joins.relation)
            .chain(table_with_joins.joins.iter().map(|join| &join.relation));

        for factor in factors {
            let reference = match factor {
                TableFactor::Table { name, alias, .. } => alias
                    .as_ref()
                    .map(|alias| alias.name.to_string())
                    .or_else(|| name.0.last().map(|ident| ident.to_string())),
                TableFactor::Derived { alias, .. } => alias.as_ref().map(|alias| alias.name.to_string()),
                _ => None,
            };
            relations.push(reference?);
        }
    }

    Some(relations)
}

/// `ORDER BY 2` -> `ORDER BY 3`
fn shift_position(expr: &mut Expr) {
    if let Expr::Value(Value::Number(position, _)) = expr {
        if let Ok(n) = position.parse::<u64>() {
            *position = (n + 1).to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector() -> TraceInjector {
        TraceInjector::new(DialectConfig::Postgres, WildcardPolicy::PassThrough)
    }

    #[test]
    fn prepends_trace_expression() {
        let sql = injector()
            .inject("SELECT id, upper(name) AS name_upper FROM raw_customers")
            .unwrap();

        assert!(sql.starts_with("SELECT CAST(MD5(CONCAT_WS('|', "));
        assert!(sql.contains("AS _row_trace_id, id, upper(name) AS name_upper FROM raw_customers"));
    }

    #[test]
    fn injection_is_idempotent() {
        let injector = injector();
        let once = injector.inject("select id from t").unwrap();
        let twice = injector.inject(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn existing_trace_column_is_left_alone() {
        let injector = injector();
        for sql in [
            "select md5(id) as _ROW_TRACE_ID, id from t",
            "select _row_trace_id, id from t",
            "select t._row_trace_id, id from t",
        ] {
            let result = injector.instrument(sql).unwrap();
            assert_eq!(result.status, InjectStatus::AlreadyTraced);
            assert_eq!(result.sql, sql);
        }
    }

    #[test]
    fn wildcard_pass_through() {
        let sql = "select * from stg_orders where amount > 0";
        let result = injector().instrument(sql).unwrap();
        assert_eq!(result.status, InjectStatus::WildcardPassThrough);
        assert_eq!(result.sql, sql);
    }

    #[test]
    fn wildcard_derive_uses_row_text() {
        let injector = TraceInjector::new(DialectConfig::Postgres, WildcardPolicy::Derive);
        let sql = injector
            .inject("select o.*, c.name from orders o join customers c on o.customer_id = c.id")
            .unwrap();
        assert!(sql.contains("CAST(o AS TEXT)"));
        assert!(sql.contains("CAST(c.name AS TEXT)"));

        let bare = injector.inject("select * from main.raw_customers").unwrap();
        assert!(bare.contains("CAST(raw_customers AS TEXT)"));
    }

    #[test]
    fn wildcard_without_relation_fails() {
        let injector = TraceInjector::new(DialectConfig::Ansi, WildcardPolicy::Derive);
        assert!(matches!(
            injector.inject("select *"),
            Err(InjectError::UnresolvableWildcard { .. })
        ));
    }

    #[test]
    fn positional_references_shift() {
        let sql = injector()
            .inject("select region, count(*) as n from orders group by 1 order by 2 desc limit 5")
            .unwrap();
        assert!(sql.contains("GROUP BY 2"));
        assert!(sql.contains("ORDER BY 3 DESC"));
        assert!(sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn distinct_on_positions_shift() {
        let sql = injector()
            .inject("select distinct on (1) customer_id, amount from orders order by 1, amount desc")
            .unwrap();
        assert!(sql.contains("DISTINCT ON (2)"), "{}", sql);
        assert!(sql.contains("ORDER BY 2, amount DESC"), "{}", sql);

        let named = injector()
            .inject("select distinct on (customer_id) customer_id, amount from orders")
            .unwrap();
        assert!(named.contains("DISTINCT ON (customer_id)"), "{}", named);
    }

    #[test]
    fn set_returning_projection_is_wrapped() {
        let sql = "select id, unnest(tags) as tag from posts order by 1";
        let result = injector().instrument(sql).unwrap();

        assert_eq!(result.status, InjectStatus::Wrapped);
        assert!(result.sql.starts_with(
            "SELECT CAST(MD5(CONCAT_WS('|', CAST(_row_trace_source AS TEXT))) AS UUID) AS _row_trace_id, \
             _row_trace_source.* FROM ("
        ));
        assert!(result.sql.ends_with(") AS _row_trace_source"));
        assert!(result
            .sql
            .to_ascii_lowercase()
            .contains("(select id, unnest(tags) as tag from posts order by 1)"));
        assert!(!result.sql.contains("COALESCE"));

        // Wrapped output is already traced
        let again = injector().instrument(&result.sql).unwrap();
        assert_eq!(again.status, InjectStatus::AlreadyTraced);
        assert_eq!(again.sql, result.sql);
    }

    #[test]
    fn set_returning_detection_needs_a_call() {
        assert!(calls_set_returning("UNNEST(tags)"));
        assert!(calls_set_returning("coalesce(x, 0) + generate_series(1, 3)"));
        assert!(!calls_set_returning("my_unnest(tags)"));
        assert!(!calls_set_returning("unnest_count"));
        assert!(calls_set_returning("pg_catalog.unnest(x)"));
    }

    #[test]
    fn every_union_branch_is_instrumented() {
        let sql = injector()
            .inject("select id from a union all select id from b")
            .unwrap();
        assert_eq!(sql.matches("AS _row_trace_id").count(), 2);
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = injector().inject("select 1; select 2").unwrap_err();
        assert!(matches!(err, InjectError::MultiStatementUnsupported { count: 2, .. }));
        assert_eq!(err.sql(), "select 1; select 2");
    }

    #[test]
    fn rejects_non_select() {
        match injector().inject("insert into t values (1)") {
            Err(InjectError::NotASelectStatement { kind, .. }) => assert_eq!(kind, "INSERT"),
            other => panic!("Expected NotASelectStatement, got {:?}", other),
        }

        match injector().inject("values (1), (2)") {
            Err(InjectError::NotASelectStatement { kind, .. }) => assert_eq!(kind, "VALUES"),
            other => panic!("Expected NotASelectStatement, got {:?}", other),
        }

        assert!(matches!(
            injector().inject("   "),
            Err(InjectError::NotASelectStatement { .. })
        ));
    }

    #[test]
    fn rejects_unparseable_sql() {
        assert!(matches!(
            injector().inject("select from where"),
            Err(InjectError::Parse(_))
        ));
    }
}
