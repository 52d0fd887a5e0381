//! Strata Migration CLI Tool
//!
//! Command-line interface for schema and function migrations. Exit codes are
//! meant for CI/CD pipelines: `status` exits `0` when up to date, `1` when
//! changes are pending and `2` on error.

mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inquire::Confirm;
use std::path::{Path, PathBuf};
use std::process;
use strata::connection::{self, redact};
use strata::metrics::METRICS;
use strata::migration::status::{EXIT_ERROR, EXIT_UP_TO_DATE};
use strata::migration::{
    generate_function, generate_migration, FunctionMigrator, MigrationLockGuard, SchemaMigrator,
    StatusReporter,
};
use strata::{StrataConfig, TransactionalConnection};

#[derive(Parser)]
#[command(name = "strata-migrate")]
#[command(about = "Transactional schema and function migrations for PostgreSQL")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Configuration file (default: config/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Schema migrations directory (overrides the configuration)
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Function files directory (overrides the configuration)
    #[arg(long)]
    functions_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Write the run's Prometheus metrics to this file on exit
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending schema and function changes
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply pending schema migrations, then synchronize functions
    Migrate {
        /// Run everything and roll it back
        #[arg(long)]
        dry: bool,

        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },

    /// Roll back every schema migration applied at or after a version
    Rollback {
        /// Lowest version to roll back
        #[arg(long)]
        to: i64,

        /// Run the rollback and roll it back
        #[arg(long)]
        dry: bool,
    },

    /// Generate an empty up/down migration pair
    Generate {
        /// Optional suffix (e.g., "create_users")
        name: Option<String>,
    },

    /// Generate a function skeleton for an entity
    GenerateFunction {
        /// Entity directory and table (e.g., "User")
        entity: String,
        /// Function file name (e.g., "getById")
        name: String,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    if cli.quiet {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error")).init();
    } else if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let metrics_file = cli.metrics_file.clone();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ Error: {e:#}");
            EXIT_ERROR
        }
    };

    if let Some(path) = metrics_file {
        write_metrics(&path);
    }
    process::exit(code);
}

/// Text exposition format, for the node_exporter textfile collector.
fn write_metrics(path: &Path) {
    match std::fs::write(path, METRICS.render()) {
        Ok(()) => log::debug!("Metrics written to {}", path.display()),
        Err(e) => log::warn!("Failed to write metrics to {}: {e}", path.display()),
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = match &cli.config {
        Some(path) => StrataConfig::load_from(path),
        None => StrataConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(dir) = cli.migrations_dir {
        config.migrations_dir = dir;
    }
    if let Some(dir) = cli.functions_dir {
        config.functions_dir = dir;
    }
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }

    match cli.command {
        Commands::Generate { name } => handle_generate(&config, name.as_deref()),
        Commands::GenerateFunction { entity, name } => handle_generate_function(&config, &entity, &name),
        Commands::Status { json } => {
            let conn = open_connection(&config)?;
            handle_status(&conn, &config, json)
        }
        Commands::Migrate { dry, force } => {
            let conn = open_connection(&config)?;
            handle_migrate(&conn, &config, dry, force)
        }
        Commands::Rollback { to, dry } => {
            let conn = open_connection(&config)?;
            handle_rollback(&conn, &config, to, dry)
        }
    }
}

fn database_url(config: &StrataConfig) -> anyhow::Result<String> {
    config
        .database_url
        .clone()
        .or_else(|| std::env::var("STRATA_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context(
            "Database URL not provided. Use --database-url or set STRATA_DATABASE_URL or DATABASE_URL environment variable.",
        )
}

fn open_connection(config: &StrataConfig) -> anyhow::Result<TransactionalConnection> {
    let url = database_url(config)?;
    connection::open(&url).with_context(|| format!("Error connecting to {}", redact(&url)))
}

fn migrators(config: &StrataConfig) -> anyhow::Result<(SchemaMigrator, FunctionMigrator)> {
    Ok((
        SchemaMigrator::from_config(config)?,
        FunctionMigrator::from_config(config)?,
    ))
}

fn handle_status(conn: &TransactionalConnection, config: &StrataConfig, json: bool) -> anyhow::Result<i32> {
    let (schema, functions) = migrators(config)?;
    let report = StatusReporter::new(&schema, &functions).report(conn)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_status(&report);
    }
    Ok(report.exit_code())
}

fn handle_migrate(
    conn: &TransactionalConnection,
    config: &StrataConfig,
    dry: bool,
    force: bool,
) -> anyhow::Result<i32> {
    let (schema, functions) = migrators(config)?;
    let _lock = if dry {
        None
    } else {
        Some(MigrationLockGuard::acquire(conn, config.lock_timeout_seconds)?)
    };

    let report = StatusReporter::new(&schema, &functions).report(conn)?;
    output::print_status(&report);

    match report.exit_code() {
        EXIT_ERROR => {
            eprintln!("❌ Status reported errors, nothing was migrated");
            return Ok(EXIT_ERROR);
        }
        EXIT_UP_TO_DATE => {
            println!("✅ Nothing to migrate");
            return Ok(0);
        }
        _ => {}
    }

    if !force && !dry {
        let proceed = Confirm::new("Apply these changes?")
            .with_default(false)
            .prompt()
            .context("Failed to read confirmation (use --force in non-interactive shells)")?;
        if !proceed {
            println!("Migration cancelled");
            return Ok(0);
        }
    }

    // a dry run keeps the schema changes visible to the function step
    if dry {
        conn.begin()?;
    }
    let applied = apply(conn, &schema, &functions);
    if dry {
        conn.rollback()?;
    }

    if applied? {
        if dry {
            println!("✅ Dry run succeeded, everything was rolled back");
        } else {
            println!("✅ Success");
        }
        Ok(0)
    } else {
        Ok(1)
    }
}

/// Schema step, then the function step unless the schema step failed.
fn apply(
    conn: &TransactionalConnection,
    schema: &SchemaMigrator,
    functions: &FunctionMigrator,
) -> anyhow::Result<bool> {
    let schema_run = schema.execute(conn, false)?;
    output::print_schema_run(&schema_run);
    if let Some(error) = &schema_run.error {
        eprintln!("❌ Schema migration failed, functions were not synchronized: {error}");
        return Ok(false);
    }

    let function_run = functions.execute(conn, false)?;
    output::print_function_run(&function_run);
    if let Some(error) = &function_run.error {
        eprintln!("❌ Function migration failed: {error}");
        return Ok(false);
    }
    Ok(true)
}

fn handle_rollback(
    conn: &TransactionalConnection,
    config: &StrataConfig,
    version: i64,
    dry: bool,
) -> anyhow::Result<i32> {
    let schema = SchemaMigrator::from_config(config)?;
    let _lock = if dry {
        None
    } else {
        Some(MigrationLockGuard::acquire(conn, config.lock_timeout_seconds)?)
    };

    let run = schema.rollback_to(conn, version, dry)?;
    output::print_schema_run(&run);
    match &run.error {
        Some(error) => {
            eprintln!("❌ Rollback failed: {error}");
            Ok(1)
        }
        None => Ok(0),
    }
}

fn handle_generate(config: &StrataConfig, name: Option<&str>) -> anyhow::Result<i32> {
    let (up, down) = generate_migration(
        &config.migrations_dir,
        &config.date_format,
        name,
        &chrono::Local::now(),
    )?;
    println!("✅ Generated migration:");
    println!("   {}", up.display());
    println!("   {}", down.display());
    Ok(0)
}

fn handle_generate_function(config: &StrataConfig, entity: &str, name: &str) -> anyhow::Result<i32> {
    let generated = generate_function(
        &config.functions_dir,
        config.function_requests_dir.as_deref(),
        entity,
        name,
    )?;
    println!("✅ Generated function {}:", generated.function_name);
    println!("   {}", generated.function_file.display());
    if let Some(request) = &generated.request_file {
        println!("   {}", request.display());
    }
    Ok(0)
}
