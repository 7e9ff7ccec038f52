//! Trace expression templates per SQL dialect
//!
//! Every template reduces a list of projected expressions to one UUID-shaped
//! text value computed by the warehouse. Null inputs are rendered as
//! `'<null>'` and an empty list as `'<empty>'` so that the expression is
//! always defined.

use rowlineage_core::DialectConfig;

/// Text substituted for NULL inputs
pub const NULL_MARKER: &str = "<null>";

/// Text hashed when there is nothing to hash
pub const EMPTY_MARKER: &str = "<empty>";

/// Separator between projected values
pub const VALUE_SEPARATOR: &str = "|";

/// RFC 4122 URL namespace, used by name-based UUID functions
pub const TRACE_NAMESPACE: &str = "6ba7b811-9dad-11d1-80b4-00c04fd430c8";

/// Most arguments one concatenation call receives besides its separator
///
/// PostgreSQL caps any function call at 100 arguments; wider projections are
/// folded into nested calls.
pub const MAX_CONCAT_ARGS: usize = 99;

/// Renders the injected trace expression for one dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceExpression {
    dialect: DialectConfig,
}

impl TraceExpression {
    pub fn new(dialect: DialectConfig) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> DialectConfig {
        self.dialect
    }

    /// Text form of one projected expression, never NULL
    pub fn column_text(&self, expr: &str) -> String {
        match self.dialect {
            DialectConfig::Ansi | DialectConfig::Postgres => {
                format!("COALESCE(CAST({} AS TEXT), '{}')", expr, NULL_MARKER)
            }
            DialectConfig::Snowflake => {
                format!("COALESCE(TO_VARCHAR({}), '{}')", expr, NULL_MARKER)
            }
            DialectConfig::BigQuery => {
                format!("COALESCE(CAST({} AS STRING), '{}')", expr, NULL_MARKER)
            }
        }
    }

    /// Text form of a whole row of `relation` (a table name or alias)
    pub fn row_text(&self, relation: &str) -> String {
        match self.dialect {
            DialectConfig::Ansi | DialectConfig::Postgres => {
                format!("CAST({} AS TEXT)", relation)
            }
            DialectConfig::Snowflake => format!("TO_VARCHAR(OBJECT_CONSTRUCT({}.*))", relation),
            DialectConfig::BigQuery => format!("TO_JSON_STRING({})", relation),
        }
    }

    /// Digest of already rendered text parts, as UUID-shaped text
    pub fn digest(&self, parts: &[String]) -> String {
        let empty = [format!("'{}'", EMPTY_MARKER)];
        let parts = if parts.is_empty() { &empty[..] } else { parts };

        match self.dialect {
            DialectConfig::Ansi | DialectConfig::Postgres => {
                format!("CAST(MD5({}) AS UUID)", concat_ws(parts.to_vec(), MAX_CONCAT_ARGS))
            }
            DialectConfig::Snowflake => format!(
                "UUID_STRING('{}', {})",
                TRACE_NAMESPACE,
                concat_ws(parts.to_vec(), MAX_CONCAT_ARGS)
            ),
            DialectConfig::BigQuery => {
                // No UUID type; lay the hex digest out as 8-4-4-4-12.
                let separator = format!("'{}'", VALUE_SEPARATOR);
                let mut items = Vec::with_capacity(parts.len() * 2);
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        items.push(separator.clone());
                    }
                    items.push(part.clone());
                }
                let hex = format!("TO_HEX(MD5({}))", concat(items, MAX_CONCAT_ARGS));
                format!(
                    "CONCAT(SUBSTR({h}, 1, 8), '-', SUBSTR({h}, 9, 4), '-', SUBSTR({h}, 13, 4), '-', SUBSTR({h}, 17, 4), '-', SUBSTR({h}, 21, 12))",
                    h = hex
                )
            }
        }
    }

    /// Trace expression over projected expressions
    pub fn for_columns<S: AsRef<str>>(&self, exprs: &[S]) -> String {
        let parts: Vec<String> = exprs
            .iter()
            .map(|expr| self.column_text(expr.as_ref()))
            .collect();
        self.digest(&parts)
    }

    /// Trace expression over the whole row of a relation
    pub fn for_row(&self, relation: &str) -> String {
        self.digest(&[self.row_text(relation)])
    }
}

impl Default for TraceExpression {
    fn default() -> Self {
        Self::new(DialectConfig::default())
    }
}

/// `CONCAT_WS('|', ...)` over never-NULL parts, nested so that no call takes
/// more than `max` parts. Nesting leaves the joined text unchanged.
fn concat_ws(parts: Vec<String>, max: usize) -> String {
    fold_calls(parts, max, |chunk| {
        format!("CONCAT_WS('{}', {})", VALUE_SEPARATOR, chunk.join(", "))
    })
}

/// `CONCAT(...)`, nested the same way
fn concat(items: Vec<String>, max: usize) -> String {
    fold_calls(items, max, |chunk| format!("CONCAT({})", chunk.join(", ")))
}

fn fold_calls(mut items: Vec<String>, max: usize, call: impl Fn(&[String]) -> String) -> String {
    let max = max.max(2);
    while items.len() > max {
        items = items.chunks(max).map(|chunk| call(chunk)).collect();
    }
    call(&items)
}
