//! SiteGate - traffic interception proxy.
//!
//! Runs the forward proxy, or answers one-off questions against the stored
//! rules and statistics.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use sitegate_app::app::App;
use sitegate_app::config::AppConfig;
use sitegate_storage::Database;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SiteGate - block sites for a household or small office
#[derive(Parser, Debug)]
#[command(name = "sitegate", version, about)]
struct Args {
    /// Config file (defaults to config.json in the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Proxy listen port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Proxy listen host
    #[arg(long, global = true)]
    host: Option<IpAddr>,

    /// Database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy until interrupted (default)
    Run,
    /// Show the decision for a URL or host
    Check {
        url: String,
        /// User id to evaluate group rules for
        #[arg(long)]
        user: Option<String>,
    },
    /// Show intercept totals per site
    Stats {
        /// Number of days to include, today included
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Delete intercept history past the retention window
    Cleanup,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "sitegate", "sitegate").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sitegate={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("sitegate")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Loads the config file and applies command line overrides.
fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(db) = &args.db {
        config.database_path = Some(db.clone());
    }

    Ok(config)
}

fn open_database(config: &AppConfig) -> anyhow::Result<Database> {
    let db = match &config.database_path {
        Some(path) => Database::with_path(path.clone()),
        None => Database::new(),
    }
    .map_err(|e| anyhow::anyhow!("Database error: {}", e))?;

    match &config.database_path {
        Some(path) => tracing::info!("Database opened at {:?}", path),
        None => tracing::info!("Database opened at {:?}", Database::default_db_path()?),
    }
    Ok(db)
}

async fn run(app: Arc<App>) -> anyhow::Result<()> {
    let proxy = app.proxy()?;
    let addr = proxy.start().await.context("Failed to start proxy")?;
    tracing::info!("Proxy listening on {}", addr);

    let cleanup = app.spawn_cleanup(app.config().cleanup_interval());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    cleanup.abort();
    proxy.stop().await;
    Ok(())
}

fn check(app: &App, url: &str, user: Option<&str>) {
    let decision = app.check(url, user);
    let source = decision.matched_rule_id().unwrap_or("default");

    println!("{} {} (matched: {})", decision.action.name(), url, source);
    if let Some(target) = &decision.redirect_target {
        println!("redirect: {}", target);
    }
}

fn stats(app: &App, days: u32) -> anyhow::Result<()> {
    let totals = app.site_totals(days)?;
    if totals.is_empty() {
        println!("No intercepts in the last {} days", days);
        return Ok(());
    }

    println!("{:<24} {:<32} {:>8} {:>5}  last", "site", "domain", "total", "days");
    for total in totals {
        println!(
            "{:<24} {:<32} {:>8} {:>5}  {}",
            total.site_id,
            total.domain,
            total.total,
            total.days,
            total.last_intercept_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::debug!("Args: {:?}", args);

    let config = load_config(&args)?;
    let db = open_database(&config)?;
    let app = Arc::new(App::open(config, db)?);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!("Starting SiteGate...");
            run(app).await?;
        }
        Command::Check { url, user } => check(&app, &url, user.as_deref()),
        Command::Stats { days } => stats(&app, days)?,
        Command::Cleanup => {
            let removed = app.cleanup();
            println!("Removed {} intercept rows", removed);
        }
    }

    tracing::info!("SiteGate shutting down");
    Ok(())
}
