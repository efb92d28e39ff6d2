//! ferrite-rmt - migrate an RDB snapshot into a live server
//!
//! Reads the snapshot, re-encodes values for the destination's format
//! version and restores every selected key over a pool of connections.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferrite_rmt::config::{Config, LogFormat, ValueKind};
use ferrite_rmt::migrate::{migrate, DestinationAddr, TcpConnector};
use ferrite_rmt::{MigrateError, MigrationSummary};

/// Migrate an RDB snapshot into a Redis-compatible server
#[derive(Parser, Debug)]
#[command(name = "ferrite-rmt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Snapshot file to migrate
    #[arg(short = 's', long = "source", value_name = "FILE", env = "RMT_SOURCE")]
    source: PathBuf,

    /// Destination server, e.g. redis://127.0.0.1:6379
    #[arg(short = 'm', long = "migrate", value_name = "URI", env = "RMT_MIGRATE")]
    migrate: String,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "RMT_CONFIG")]
    config: Option<PathBuf>,

    /// Overwrite keys that already exist on the destination
    #[arg(short = 'r', long = "replace")]
    replace: bool,

    /// With --replace, delete then restore through a server-side script for
    /// servers whose RESTORE lacks REPLACE
    #[arg(short = 'l', long = "legacy")]
    legacy: bool,

    /// Only migrate these databases
    #[arg(short = 'd', long = "db", value_name = "NUM", num_args = 1..)]
    db: Vec<u32>,

    /// Only migrate keys matching any of these patterns
    #[arg(short = 'k', long = "key", value_name = "REGEX", num_args = 1..)]
    key: Vec<String>,

    /// Only migrate values of these types
    #[arg(short = 't', long = "type", value_name = "TYPE", num_args = 1..)]
    kind: Vec<ValueKind>,

    /// Number of destination connections
    #[arg(long = "threads", value_name = "NUM", env = "RMT_THREADS")]
    threads: Option<usize>,

    /// Attempts per key after the first one fails
    #[arg(long = "retries", value_name = "NUM")]
    retries: Option<u32>,

    /// Payload format version understood by the destination
    #[arg(long = "rdb-version", value_name = "VERSION", env = "RMT_RDB_VERSION")]
    rdb_version: Option<u16>,

    /// Pipeline restores and check replies at flush points only
    #[arg(long = "no-flush")]
    no_flush: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long = "log-level", value_name = "LEVEL", env = "RMT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    config.validate()?;
    init_logging(&config);

    let addr = DestinationAddr::parse(&cli.migrate)?;
    let connector = TcpConnector::new(
        addr.clone(),
        config.migrate.batch_size,
        config.migrate.timeout(),
    );

    println!(
        "{} Migrating {} → {} ({} connections)...",
        "→".cyan().bold(),
        cli.source.display().to_string().yellow(),
        addr.to_string().yellow(),
        config.migrate.threads
    );

    let start = Instant::now();
    let summary = migrate(&config, &cli.source, Arc::new(connector)).await?;
    print_summary(&summary, start.elapsed());
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // ── CLI overrides ────────────────────────────────────────────────────

    if cli.replace {
        config.migrate.replace = true;
    }
    if cli.legacy {
        config.migrate.legacy = true;
    }
    if cli.no_flush {
        config.migrate.flush = false;
    }
    if let Some(threads) = cli.threads {
        config.migrate.threads = threads;
    }
    if let Some(retries) = cli.retries {
        config.migrate.retries = retries;
    }
    if let Some(version) = cli.rdb_version {
        config.dump.rdb_version = Some(version);
    }
    if !cli.db.is_empty() {
        config.filter.db = cli.db.clone();
    }
    if !cli.key.is_empty() {
        config.filter.keys = cli.key.clone();
    }
    if !cli.kind.is_empty() {
        config.filter.types = cli.kind.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.format = LogFormat::Json;
    }
    Ok(config)
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_summary(summary: &MigrationSummary, elapsed: Duration) {
    let mark = if summary.has_failures() {
        "!".yellow().bold()
    } else {
        "✓".green().bold()
    };
    println!("{} Migration finished in {}", mark, format_duration(elapsed));
    println!();
    println!("{}", "Result Summary".bold().underline());
    println!("  Keys restored:   {}", summary.restored.to_string().green());
    println!("  Keys expired:    {}", summary.expired);
    println!("  Keys filtered:   {}", summary.filtered);
    if summary.has_failures() {
        println!("  Keys failed:     {}", summary.failed.to_string().red());
        println!("  Encode failures: {}", summary.encode_failed.to_string().red());
    } else {
        println!("  Keys failed:     0");
    }
    println!("  Retries:         {}", summary.retries);
    println!("  Reconnects:      {}", summary.reconnects);
    println!("  Data sent:       {}", format_bytes(summary.bytes_sent));
    if elapsed.as_secs_f64() > 0.0 {
        println!(
            "  Throughput:      {:.0} keys/s",
            summary.processed() as f64 / elapsed.as_secs_f64()
        );
    }
}

fn report(e: &anyhow::Error) {
    eprintln!("{} {:#}", "error:".red().bold(), e);

    match e.downcast_ref::<MigrateError>() {
        Some(MigrateError::ConnectFailed { addr, .. }) => {
            eprintln!(
                "  {} is {} reachable and accepting connections?",
                "hint:".cyan().bold(),
                addr
            );
        }
        Some(err) if err.is_internal() => {
            eprintln!(
                "  {} fatal error, check the log and report an issue",
                "note:".yellow().bold()
            );
        }
        _ => {}
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}
