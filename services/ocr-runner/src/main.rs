//! OCR batch runner
//!
//! Single binary that:
//! 1. Loads API keys from the key file or `GEMINI_API_KEY_*` variables
//! 2. Restores per-key usage from the stats file
//! 3. Runs every pending image through the rate-limited scheduler
//! 4. Writes annotations, a processing report and updated stats
//!
//! Subcommands other than `run` manage the keys and inspect their stats.

mod admin;
mod batch;
mod config;
mod metrics;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use key_pool::{
    Clock, CredentialPool, LimitOverrides, RequestScheduler, StatsRecorder, load_specs,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{GeminiTransport, Transport};

use crate::admin::Admin;
use crate::batch::BatchSettings;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "ocr-runner")]
#[command(about = "Rate-limited multi-key OCR batch runner", version)]
struct Cli {
    /// Config file (default: $CONFIG_PATH or ocr-runner.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every pending image (default)
    Run {
        /// Serve /health and /metrics on this address
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
    },

    /// List keys with usage, limits and eligibility
    List,

    /// Add a key to the key file
    Add {
        key: String,
        #[arg(short, long)]
        alias: Option<String>,
        /// Per-key requests per minute
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        rpm: Option<u32>,
        /// Per-key requests per day
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        rpd: Option<u32>,
    },

    /// Remove a key from the key file
    Remove { alias: String },

    /// Re-enable a disabled key
    Reset { alias: String },

    /// Check keys against the service, disabling rejected ones
    Test { alias: Option<String> },

    /// Show aggregate and per-key stats
    Stats,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support.
    // Logs go to stderr so command output stays on stdout.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let (config_path, explicit) = Config::resolve_path(cli.config.as_deref());
    let config = Config::load_or_default(&config_path, explicit)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        from_file = config_path.exists(),
        "configuration loaded"
    );

    let clock = Clock::system();
    let mut stdout = std::io::stdout();

    match cli.command.unwrap_or(Commands::Run { listen: None }) {
        Commands::Run { listen } => run(config, clock, listen).await,
        Commands::List => {
            Admin::new(&config, clock).list(&mut stdout).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Add {
            key,
            alias,
            rpm,
            rpd,
        } => {
            let overrides = LimitOverrides { rpm, rpd };
            Admin::new(&config, clock)
                .add(&key, alias, overrides, &mut stdout)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { alias } => {
            Admin::new(&config, clock).remove(&alias, &mut stdout).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset { alias } => {
            Admin::new(&config, clock).reset(&alias, &mut stdout).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Test { alias } => {
            let transport = build_transport(&config)?;
            Admin::new(&config, clock)
                .test(&transport, alias.as_deref(), &mut stdout)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            Admin::new(&config, clock).stats(&mut stdout).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_transport(config: &Config) -> Result<GeminiTransport> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport = GeminiTransport::new(client, config.gemini_settings())?;
    Ok(transport)
}

async fn run(
    config: Config,
    clock: Clock,
    listen: Option<std::net::SocketAddr>,
) -> Result<ExitCode> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4().as_simple());
    info!(run_id = %run_id, "starting ocr-runner");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let specs = load_specs(&config.keys.file, &config.keys.env_prefix).await?;
    let recorder = Arc::new(StatsRecorder::new(
        config.keys.stats_file.clone(),
        Some(run_id.clone()),
    ));
    let persisted = recorder.load().await;
    let pool = Arc::new(CredentialPool::load(
        specs,
        &persisted,
        config.rate_limits(),
        clock.now_millis(),
    )?);

    let transport: Arc<dyn Transport> = Arc::new(build_transport(&config)?);
    let shutdown = CancellationToken::new();
    let stop = shutdown.child_token();
    let mut scheduler = RequestScheduler::new(
        Arc::clone(&pool),
        config.rotation.strategy.build(config.rotation.weights),
        transport,
        Arc::clone(&recorder),
        config.retry_policy(),
        clock,
        stop.clone(),
    );
    if let Some(quiet) = config.quiet_hours() {
        scheduler = scheduler.with_quiet_hours(quiet);
    }
    let scheduler = Arc::new(scheduler);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let listen_addr = listen.or(config.server.as_ref().map(|s| s.listen_addr));
    let server_handle = match listen_addr {
        Some(addr) => {
            let max_connections = config.server.as_ref().map_or(64, |s| s.max_connections);
            let state = server::AppState {
                pool: Arc::clone(&pool),
                clock,
                prometheus: prometheus_handle,
                started_at: Instant::now(),
            };
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind to {addr}"))?;
            let app = server::build_router(state, max_connections);
            Some(server::spawn(listener, app, stop.clone()))
        }
        None => None,
    };

    let settings = BatchSettings::from_config(&config);
    let result = batch::run_batch(scheduler, settings, stop.clone(), &run_id).await;

    // Final snapshot regardless of how the batch ended
    if let Err(e) = recorder.persist(&pool).await {
        warn!(error = %e, "failed to persist final stats");
    }

    stop.cancel();
    if let Some(handle) = server_handle
        && let Err(e) = handle.await
    {
        warn!(error = %e, "status listener task failed");
    }

    let report = result?;
    println!(
        "processed {} / failed {} / remaining {} of {} image(s) in {:.1}s",
        report.processed,
        report.failed,
        report.remaining,
        report.total_images,
        report.duration_seconds
    );
    if let Some(retry_at) = report.retry_at {
        println!("no dispatch possible before {}, retry then", retry_at.to_rfc3339());
    }

    info!("shutdown complete");
    Ok(ExitCode::from(report.exit_code()))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, stopping batch"),
        _ = terminate => info!("received SIGTERM, stopping batch"),
    }
}
