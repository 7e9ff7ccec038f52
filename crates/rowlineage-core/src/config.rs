//! Configuration schema (rowlineage.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SQL dialect configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectConfig {
    /// BigQuery SQL dialect
    BigQuery,

    /// Snowflake SQL dialect
    Snowflake,

    /// PostgreSQL SQL dialect
    Postgres,

    /// Generic ANSI SQL
    Ansi,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self::Ansi
    }
}

/// Export sink format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Append-only JSON lines file
    Jsonl,

    /// Columnar snapshot, replaced on every export
    Parquet,

    /// Relational table (`lineage__mappings`)
    Table,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self::Jsonl
    }
}

impl ExportFormat {
    /// File name used when `export_path` names a directory
    pub fn file_name(&self) -> Option<&'static str> {
        match self {
            Self::Jsonl => Some("lineage.jsonl"),
            Self::Parquet => Some("lineage.parquet"),
            Self::Table => None,
        }
    }

    fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Jsonl => Some("jsonl"),
            Self::Parquet => Some("parquet"),
            Self::Table => None,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jsonl => write!(f, "jsonl"),
            Self::Parquet => write!(f, "parquet"),
            Self::Table => write!(f, "table"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => Ok(Self::Jsonl),
            "parquet" => Ok(Self::Parquet),
            "table" => Ok(Self::Table),
            other => Err(ConfigError::Invalid(format!(
                "Unsupported export format '{}'. Supported: jsonl, parquet, table",
                other
            ))),
        }
    }
}

/// What the trace injector does with projections containing `*`
///
/// A wildcard over an already instrumented relation carries the upstream
/// trace column through, so prepending a second one would duplicate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardPolicy {
    /// Leave wildcard selects untouched and inherit the upstream trace column
    PassThrough,

    /// Derive a new trace id from the whole row of every wildcard relation
    Derive,
}

impl Default for WildcardPolicy {
    fn default() -> Self {
        Self::PassThrough
    }
}

/// How target rows are matched to source rows
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Correspondence {
    /// Parent tokens when the target rows carry them, trace ids otherwise
    #[default]
    Auto,

    /// Target trace id equals source trace id (pass-through and filters)
    TraceId,

    /// Target rows list their upstream trace ids in `_row_parent_trace_ids`
    ParentTokens,

    /// Shared business key; `source[i]` corresponds to `target[i]`
    Columns {
        source: Vec<String>,
        target: Vec<String>,
    },
}

/// Strategy names accepted in `[[correspondence]]` tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrespondenceStrategy {
    Auto,
    TraceId,
    ParentTokens,
    Columns,
}

/// Per-model correspondence override
///
/// ```toml
/// [[correspondence]]
/// models = ["region_*"]
/// strategy = "columns"
/// source = ["region"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrespondenceRule {
    /// Target model names (glob patterns)
    pub models: Vec<String>,

    /// Pairing strategy
    pub strategy: CorrespondenceStrategy,

    /// Key columns on the source side (columns strategy)
    #[serde(default)]
    pub source: Vec<String>,

    /// Key columns on the target side; defaults to `source`
    #[serde(default)]
    pub target: Vec<String>,
}

impl CorrespondenceRule {
    /// Check if this rule applies to a model
    pub fn matches(&self, model: &str) -> bool {
        self.models.iter().any(|pattern| {
            // Simple glob matching (* and **)
            if pattern.contains('*') {
                glob_match(pattern, model)
            } else {
                pattern == model
            }
        })
    }

    /// Convert to the pairing policy
    pub fn to_correspondence(&self) -> Correspondence {
        match self.strategy {
            CorrespondenceStrategy::Auto => Correspondence::Auto,
            CorrespondenceStrategy::TraceId => Correspondence::TraceId,
            CorrespondenceStrategy::ParentTokens => Correspondence::ParentTokens,
            CorrespondenceStrategy::Columns => {
                let target = if self.target.is_empty() {
                    self.source.clone()
                } else {
                    self.target.clone()
                };
                Correspondence::Columns {
                    source: self.source.clone(),
                    target,
                }
            }
        }
    }
}

/// PostgreSQL connection descriptor for the table sink
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConnection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Use a TLS connection
    #[serde(default)]
    pub tls: bool,

    /// Schema holding `lineage__mappings` (search_path default when unset)
    #[serde(default)]
    pub schema: Option<String>,
}

impl PostgresConnection {
    /// Render as a libpq-style key/value connection string
    pub fn connection_string(&self) -> String {
        let mut conn = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.database, self.user
        );
        if let Some(password) = &self.password {
            conn.push_str(&format!(" password={}", password));
        }
        conn
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("schema", &self.schema)
            .finish()
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

/// Connection for the `table` export format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// PostgreSQL server
    Postgres(PostgresConnection),

    /// Local SQLite database file
    Sqlite { path: PathBuf },
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageConfig {
    /// Master switch; when false injection and capture are no-ops
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Export sink format
    #[serde(default)]
    pub export_format: ExportFormat,

    /// Directory (or file) for the jsonl/parquet sinks
    #[serde(default)]
    pub export_path: Option<PathBuf>,

    /// Connection for the table sink
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,

    /// SQL dialect used to render the trace expression
    #[serde(default)]
    pub dialect: DialectConfig,

    /// Handling of `SELECT *` projections
    #[serde(default)]
    pub wildcard_policy: WildcardPolicy,

    /// Upper bound on how long a downstream capture waits for its upstreams
    #[serde(default = "default_wait_secs")]
    pub upstream_wait_timeout_secs: u64,

    /// Per-model correspondence overrides (first match wins)
    #[serde(default)]
    pub correspondence: Vec<CorrespondenceRule>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_wait_secs() -> u64 {
    300
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_format: ExportFormat::default(),
            export_path: None,
            connection: None,
            dialect: DialectConfig::default(),
            wildcard_policy: WildcardPolicy::default(),
            upstream_wait_timeout_secs: default_wait_secs(),
            correspondence: Vec::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl LineageConfig {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: LineageConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Build config from flat pipeline variables (`rowlineage_enabled`,
    /// `rowlineage_export_format`, `rowlineage_export_path`)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(enabled) = vars.get("rowlineage_enabled") {
            config.enabled = match enabled.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "rowlineage_enabled must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }

        if let Some(format) = vars.get("rowlineage_export_format") {
            config.export_format = format.parse()?;
        }

        if let Some(path) = vars.get("rowlineage_export_path") {
            config.export_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Check that the chosen export format has what it needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.export_format {
            ExportFormat::Jsonl | ExportFormat::Parquet if self.export_path.is_none() => {
                Err(ConfigError::Invalid(format!(
                    "export_path is required for the {} export format",
                    self.export_format
                )))
            }
            ExportFormat::Table if self.connection.is_none() => Err(ConfigError::Invalid(
                "a [connection] section is required for the table export format".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolved file for the jsonl/parquet sinks
    ///
    /// `export_path` is used as-is when it already carries the format's
    /// extension, otherwise it is treated as a directory.
    pub fn export_file(&self) -> Option<PathBuf> {
        let path = self.export_path.as_ref()?;
        let path = if path.is_relative() && !self.project_root.as_os_str().is_empty() {
            self.project_root.join(path)
        } else {
            path.clone()
        };

        let extension = self.export_format.extension()?;
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            Some(path)
        } else {
            self.export_format.file_name().map(|name| path.join(name))
        }
    }

    /// Pairing policy for a target model
    pub fn correspondence_for(&self, model: &str) -> Correspondence {
        self.correspondence
            .iter()
            .find(|rule| rule.matches(model))
            .map(CorrespondenceRule::to_correspondence)
            .unwrap_or_default()
    }

    /// Upstream wait bound as a duration
    pub fn upstream_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_wait_timeout_secs)
    }
}

/// Simple glob matching (supports * and **)
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }

    if let Some(star_pos) = pattern.find('*') {
        let prefix = &pattern[..star_pos];
        let suffix = pattern[star_pos + 1..].trim_start_matches('*');

        text.len() >= prefix.len() + suffix.len()
            && text.starts_with(prefix)
            && text.ends_with(suffix)
    } else {
        pattern == text
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LineageConfig::default();
        assert!(config.enabled);
        assert_eq!(config.export_format, ExportFormat::Jsonl);
        assert_eq!(config.dialect, DialectConfig::Ansi);
        assert_eq!(config.wildcard_policy, WildcardPolicy::PassThrough);
        assert_eq!(config.upstream_wait_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn parse_full_toml() {
        let config = LineageConfig::from_toml(
            r#"
            enabled = true
            export_format = "table"
            dialect = "postgres"
            wildcard_policy = "derive"

            [connection]
            type = "postgres"
            host = "db.internal"
            database = "analytics"
            user = "lineage"
            password = "secret"

            [[correspondence]]
            models = ["region_*"]
            strategy = "columns"
            source = ["region"]
            "#,
        )
        .unwrap();

        assert_eq!(config.export_format, ExportFormat::Table);
        assert_eq!(config.wildcard_policy, WildcardPolicy::Derive);
        match &config.connection {
            Some(ConnectionConfig::Postgres(pg)) => {
                assert_eq!(pg.host, "db.internal");
                assert_eq!(pg.port, 5432);
                assert!(!format!("{:?}", pg).contains("secret"));
            }
            other => panic!("Expected postgres connection, got {:?}", other),
        }
        assert_eq!(
            config.correspondence_for("region_rollup"),
            Correspondence::Columns {
                source: vec!["region".to_string()],
                target: vec!["region".to_string()],
            }
        );
        assert_eq!(config.correspondence_for("customers"), Correspondence::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sqlite_connection() {
        let config = LineageConfig::from_toml(
            r#"
            export_format = "table"
            [connection]
            type = "sqlite"
            path = "target/lineage.db"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.connection,
            Some(ConnectionConfig::Sqlite { path: PathBuf::from("target/lineage.db") })
        );
    }

    #[test]
    fn validate_requires_sink_settings() {
        let config = LineageConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = LineageConfig {
            export_format: ExportFormat::Table,
            ..LineageConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn export_file_resolution() {
        let mut config = LineageConfig {
            export_path: Some(PathBuf::from("/tmp/out")),
            project_root: PathBuf::from("/project"),
            ..LineageConfig::default()
        };
        assert_eq!(config.export_file(), Some(PathBuf::from("/tmp/out/lineage.jsonl")));

        config.export_format = ExportFormat::Parquet;
        config.export_path = Some(PathBuf::from("output/lineage/run.parquet"));
        assert_eq!(
            config.export_file(),
            Some(PathBuf::from("/project/output/lineage/run.parquet"))
        );

        config.export_format = ExportFormat::Table;
        assert_eq!(config.export_file(), None);
    }

    #[test]
    fn from_vars() {
        let mut vars = HashMap::new();
        vars.insert("rowlineage_enabled".to_string(), "false".to_string());
        vars.insert("rowlineage_export_format".to_string(), "parquet".to_string());
        vars.insert("rowlineage_export_path".to_string(), "output/lineage".to_string());

        let config = LineageConfig::from_vars(&vars).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.export_format, ExportFormat::Parquet);
        assert_eq!(config.export_path, Some(PathBuf::from("output/lineage")));

        vars.insert("rowlineage_export_format".to_string(), "csv".to_string());
        assert!(LineageConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn config_toml_roundtrip() {
        let config = LineageConfig {
            export_path: Some(PathBuf::from("output")),
            ..LineageConfig::default()
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed = LineageConfig::from_toml(&toml).unwrap();
        assert_eq!(config.export_path, parsed.export_path);
        assert_eq!(config.export_format, parsed.export_format);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("stg_*", "stg_users"));
        assert!(glob_match("*_rollup", "region_rollup"));
        assert!(!glob_match("stg_*", "users"));
    }
}
