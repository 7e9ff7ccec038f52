use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rowlineage_core::{
    CaptureSummary, ConnectionConfig, LineageConfig, LineageMapping, PostgresConnection, Row,
    Severity,
};
use rowlineage_dbt::{DependencyGraph, Manifest};
use rowlineage_export::open_writer;
use rowlineage_sql::{InjectStatus, TraceInjector};

const CONFIG_FILE: &str = "rowlineage.toml";

/// rowlineage - Row-level lineage capture for dbt
#[derive(Parser)]
#[command(name = "rowlineage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: rowlineage.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture row lineage for a whole project against PostgreSQL
    Capture {
        /// Path to dbt manifest.json
        #[arg(short = 'f', long, default_value = "target/manifest.json")]
        manifest: PathBuf,

        /// Project root used to resolve relative export paths
        #[arg(long)]
        project_root: Option<PathBuf>,

        /// Export directory (overrides export_path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the capture summary as JSON to this file
        #[arg(long)]
        summary: Option<PathBuf>,

        #[command(flatten)]
        db: ConnectionFlags,
    },

    /// Print a statement with the trace column injected
    Inject {
        /// File holding compiled SQL
        file: Option<PathBuf>,

        /// SQL text (instead of a file)
        #[arg(long, conflicts_with = "file")]
        sql: Option<String>,
    },

    /// Print the mapping records of the configured sink
    Show {
        /// Only records where this model is the source or the target
        #[arg(short, long)]
        model: Option<String>,

        /// Print at most this many records
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the derived trace id of a row
    Derive {
        /// Row as a JSON object, e.g. '{"id": 1, "name": "ann"}'
        #[arg(long)]
        row: String,
    },
}

/// Warehouse connection overrides
#[derive(Args, Debug, Default)]
struct ConnectionFlags {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Schema for the mapping table
    #[arg(long)]
    schema: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref(), cli.verbose)?;

    if cli.verbose {
        eprintln!(
            "{} dialect: {:?}, export: {}",
            "Using".cyan(),
            config.dialect,
            config.export_format
        );
    }

    match cli.command {
        Commands::Capture { manifest, project_root, output, summary, db } => {
            let mut config = config;
            if let Some(root) = project_root {
                config.project_root = root;
            }
            if let Some(output) = output {
                config.export_path = Some(output);
            }
            capture_command(config, &manifest, summary.as_deref(), &db, cli.verbose).await
        }
        Commands::Inject { file, sql } => inject_command(&config, file.as_deref(), sql, cli.verbose),
        Commands::Show { model, limit, json } => {
            show_command(&config, model.as_deref(), limit, json).await
        }
        Commands::Derive { row } => derive_command(&row),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Config precedence: `--config`, then `rowlineage.toml`, then `ROWLINEAGE_*`
/// variables, then defaults
fn load_config(explicit: Option<&Path>, verbose: bool) -> Result<LineageConfig> {
    if let Some(path) = explicit {
        return LineageConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if Path::new(CONFIG_FILE).exists() {
        return Ok(LineageConfig::from_file(Path::new(CONFIG_FILE))?);
    }

    let vars = lineage_vars(std::env::vars());
    if !vars.is_empty() {
        if verbose {
            eprintln!("{}", "Using ROWLINEAGE_* environment variables".yellow());
        }
        return Ok(LineageConfig::from_vars(&vars)?);
    }

    if verbose {
        eprintln!("{}", "No config file found, using defaults".yellow());
    }
    Ok(LineageConfig::default())
}

/// `ROWLINEAGE_EXPORT_PATH` style variables, keyed the way pipeline vars are
fn lineage_vars(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(key, value)| {
        let key = key.to_lowercase();
        key.starts_with("rowlineage_").then_some((key, value))
    })
    .collect()
}

/// First value found among flag, `DBT_*`, `PG*` and config
fn pick(flag: Option<&str>, env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    flag.map(str::to_string)
        .or_else(|| keys.iter().find_map(|key| env(key).filter(|v| !v.is_empty())))
}

/// Resolve the warehouse connection from config, env and flags
fn resolve_connection(
    config: &LineageConfig,
    flags: &ConnectionFlags,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PostgresConnection> {
    let base = match &config.connection {
        Some(ConnectionConfig::Postgres(conn)) => Some(conn),
        _ => None,
    };

    let host = pick(flags.host.as_deref(), &env, &["DBT_HOST", "PGHOST"])
        .or_else(|| base.map(|c| c.host.clone()))
        .unwrap_or_else(|| "localhost".to_string());

    let port = match flags.port {
        Some(port) => port,
        None => match pick(None, &env, &["DBT_PORT", "PGPORT"]) {
            Some(port) => port
                .parse()
                .with_context(|| format!("Invalid port '{}'", port))?,
            None => base.map(|c| c.port).unwrap_or(5432),
        },
    };

    let database = pick(flags.database.as_deref(), &env, &["DBT_DATABASE", "PGDATABASE"])
        .or_else(|| base.map(|c| c.database.clone()))
        .ok_or_else(|| anyhow::anyhow!(
            "No database configured. Pass --database, set DBT_DATABASE/PGDATABASE, \
             or add a [connection] section to {}",
            CONFIG_FILE
        ))?;

    let user = pick(flags.user.as_deref(), &env, &["DBT_USER", "PGUSER"])
        .or_else(|| base.map(|c| c.user.clone()))
        .ok_or_else(|| anyhow::anyhow!("No user configured. Pass --user or set DBT_USER/PGUSER"))?;

    let password = pick(flags.password.as_deref(), &env, &["DBT_PASSWORD", "PGPASSWORD"])
        .or_else(|| base.and_then(|c| c.password.clone()));

    let schema = pick(flags.schema.as_deref(), &env, &["DBT_SCHEMA"])
        .or_else(|| base.and_then(|c| c.schema.clone()));

    Ok(PostgresConnection {
        host,
        port,
        database,
        user,
        password,
        tls: base.map(|c| c.tls).unwrap_or(false),
        schema,
    })
}

/// Capture command - manual project capture
async fn capture_command(
    config: LineageConfig,
    manifest_path: &Path,
    summary_path: Option<&Path>,
    flags: &ConnectionFlags,
    verbose: bool,
) -> Result<()> {
    if !manifest_path.exists() {
        return Err(anyhow::anyhow!(
            "Manifest not found at {}. Run 'dbt compile' or 'dbt build' first.",
            manifest_path.display()
        ));
    }

    if verbose {
        eprintln!("{} {}", "Loading manifest from:".cyan(), manifest_path.display());
    }

    let manifest = Manifest::from_file(manifest_path)?;
    let graph = DependencyGraph::from_manifest(&manifest)?;

    if verbose {
        eprintln!("{} {} models", "Dependency graph:".cyan(), graph.len());
    }

    let conn = resolve_connection(&config, flags, |key| std::env::var(key).ok())?;
    let summary = run_capture(config, graph, &conn, verbose).await?;

    print_capture_summary(&summary);

    if let Some(path) = summary_path {
        summary.save_to_file(path)?;
        eprintln!("{} {}", "Summary saved to:".green(), path.display());
    }

    if summary.has_errors() {
        return Err(anyhow::anyhow!(
            "Lineage capture finished with {} error(s)",
            summary.counts.errors
        ));
    }

    Ok(())
}

#[cfg(feature = "postgres")]
async fn run_capture(
    config: LineageConfig,
    graph: DependencyGraph,
    conn: &PostgresConnection,
    verbose: bool,
) -> Result<CaptureSummary> {
    use rowlineage_runtime::{capture_lineage_for_project, Orchestrator, PostgresSource};

    if verbose {
        eprintln!("{} {}:{}/{}...", "Connecting to".cyan(), conn.host, conn.port, conn.database);
    }

    let expression = *TraceInjector::from_config(&config).expression();
    let source = PostgresSource::connect(conn, expression)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to warehouse: {}", e))?;

    if verbose {
        eprintln!("{}", "✓ Connection successful".green());
    }

    let orchestrator = Orchestrator::from_config(config).await?;
    Ok(capture_lineage_for_project(&orchestrator, graph, &source).await?)
}

#[cfg(not(feature = "postgres"))]
async fn run_capture(
    _config: LineageConfig,
    _graph: DependencyGraph,
    _conn: &PostgresConnection,
    _verbose: bool,
) -> Result<CaptureSummary> {
    Err(anyhow::anyhow!(
        "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres"
    ))
}

/// Inject command - print instrumented SQL
fn inject_command(
    config: &LineageConfig,
    file: Option<&Path>,
    sql: Option<String>,
    verbose: bool,
) -> Result<()> {
    let sql = match (file, sql) {
        (_, Some(sql)) => sql,
        (Some(path), None) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => return Err(anyhow::anyhow!("Pass a SQL file or --sql <text>")),
    };

    let instrumented = TraceInjector::from_config(config).instrument(&sql)?;

    if verbose {
        let status = match instrumented.status {
            InjectStatus::Injected => "trace column injected".green(),
            InjectStatus::AlreadyTraced => "already traced, unchanged".yellow(),
            InjectStatus::WildcardPassThrough => "wildcard pass-through, unchanged".yellow(),
            InjectStatus::Wrapped => "set-returning projection, wrapped in a traced subquery".green(),
        };
        eprintln!("{} {}", "Status:".cyan(), status);
    }

    println!("{}", instrumented.sql);
    Ok(())
}

/// Show command - read back the configured sink
async fn show_command(
    config: &LineageConfig,
    model: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let writer = open_writer(config).await?;
    let records: Vec<LineageMapping> = writer
        .read_all()
        .await?
        .into_iter()
        .filter(|r| model.map_or(true, |m| r.source_model == m || r.target_model == m))
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Row Lineage Records".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
    println!("Sink: {}", writer.destination());
    println!("Records: {}", records.len());
    println!();

    for record in &records {
        println!(
            "  {} {} {} {}",
            record.source_model.cyan(),
            record.source_trace_id,
            "→".bright_blue(),
            format!("{} {}", record.target_model, record.target_trace_id).yellow()
        );
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}

/// Derive command - print the trace id computed from a row
fn derive_command(row: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(row).context("Row is not valid JSON")?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("Row must be a JSON object"))?;

    let id = rowlineage_engine::derive(&Row::from_json_object(object))?;
    println!("{}", id);
    Ok(())
}

fn print_capture_summary(summary: &CaptureSummary) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Row Lineage Capture Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Run: {}", summary.run_id);
    println!("Models processed: {}", summary.models_processed);
    println!("Edges captured: {}", summary.edges_captured);
    if summary.edges_skipped > 0 {
        println!("Edges skipped: {}", format!("{}", summary.edges_skipped).yellow());
    }
    println!("Records captured: {}", summary.records_captured);
    for (sink, count) in &summary.records_written {
        println!("  {} {}", format!("{:>8}", count).green(), sink);
    }
    println!();

    println!("{}", "Summary:".bold());
    println!("  Total diagnostics: {}", summary.counts.total);

    if summary.counts.errors > 0 {
        println!("  Errors:   {}", format!("{}", summary.counts.errors).red().bold());
    } else {
        println!("  Errors:   {}", format!("{}", summary.counts.errors).green());
    }

    if summary.counts.warnings > 0 {
        println!("  Warnings: {}", format!("{}", summary.counts.warnings).yellow());
    } else {
        println!("  Warnings: {}", format!("{}", summary.counts.warnings).green());
    }

    println!("  Info:     {}", summary.counts.info);
    println!();

    if summary.diagnostics.is_empty() {
        println!("{}", "✓ Lineage captured for every edge!".green().bold());
    } else {
        println!("{}", "Diagnostics:".bold());
        for diag in &summary.diagnostics {
            let severity = match diag.severity {
                Severity::Error => "ERROR".red().bold(),
                Severity::Warn => "WARN".yellow().bold(),
                Severity::Info => "INFO".cyan().bold(),
            };
            let model = diag.model.as_deref().unwrap_or("-");
            println!("  [{}] {} {}: {}", severity, diag.code.as_str(), model, diag.message);
            if let Some(detail) = &diag.detail {
                println!("    {}", detail.dimmed());
            }
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn flags_beat_environment_and_config() {
        let config = LineageConfig::from_toml(
            r#"
            export_format = "table"

            [connection]
            type = "postgres"
            host = "db.internal"
            database = "analytics"
            user = "dbt"
            tls = true
            "#,
        )
        .unwrap();

        let flags = ConnectionFlags {
            user: Some("ops".to_string()),
            ..Default::default()
        };
        let conn = resolve_connection(
            &config,
            &flags,
            env(&[("PGHOST", "pg.local"), ("DBT_USER", "ignored"), ("PGPORT", "6432")]),
        )
        .unwrap();

        assert_eq!(conn.host, "pg.local");
        assert_eq!(conn.port, 6432);
        assert_eq!(conn.database, "analytics");
        assert_eq!(conn.user, "ops");
        assert!(conn.tls);
    }

    #[test]
    fn dbt_variables_beat_libpq_variables() {
        let conn = resolve_connection(
            &LineageConfig::default(),
            &ConnectionFlags::default(),
            env(&[
                ("DBT_HOST", "dbt-host"),
                ("PGHOST", "pg-host"),
                ("PGDATABASE", "warehouse"),
                ("PGUSER", "loader"),
            ]),
        )
        .unwrap();

        assert_eq!(conn.host, "dbt-host");
        assert_eq!(conn.port, 5432);
        assert_eq!(conn.database, "warehouse");
        assert_eq!(conn.user, "loader");
        assert_eq!(conn.password, None);
    }

    #[test]
    fn missing_database_is_an_error() {
        let err = resolve_connection(&LineageConfig::default(), &ConnectionFlags::default(), env(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("No database configured"));
    }

    #[test]
    fn invalid_port_is_an_error() {
        let err = resolve_connection(
            &LineageConfig::default(),
            &ConnectionFlags::default(),
            env(&[("PGPORT", "five"), ("PGDATABASE", "d"), ("PGUSER", "u")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid port"));
    }

    #[test]
    fn lineage_variables_are_lowercased() {
        let vars = lineage_vars(
            vec![
                ("ROWLINEAGE_EXPORT_FORMAT".to_string(), "parquet".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["rowlineage_export_format"], "parquet");
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rowlineage", "show", "--json", "-v", "--model", "orders"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Show { json: true, model: Some(ref m), .. } if m == "orders"
        ));
    }
}
