use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use relaystats::{agent, config};

/// Relay fleet status poller.
#[derive(Parser)]
#[command(name = "relaystats", about)]
struct Cli {
    /// Path to the YAML configuration file (defaults apply when omitted).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// InfluxDB user (overrides influx.username).
    #[arg(short = 'u', long)]
    influx_user: Option<String>,

    /// InfluxDB password (overrides influx.password).
    #[arg(short = 'p', long)]
    influx_pass: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("relaystats {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::default(),
    };

    if let Some(user) = cli.influx_user {
        cfg.influx.username = user;
    }
    if let Some(pass) = cli.influx_pass {
        cfg.influx.password = pass;
    }
    cfg.validate().context("validating configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting relaystats",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = agent::Agent::new(cfg)?;
    let addr = agent.start().await?;
    tracing::info!(addr = %addr, "serving relay status");

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("relaystats stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received SIGINT, shutting down");
}
