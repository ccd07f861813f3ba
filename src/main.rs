use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use dnstap_processor::agent::Agent;
use dnstap_processor::config::Config;

/// DNS telemetry ingestion agent for recursor edge nodes.
#[derive(Parser)]
#[command(name = "dnstap-processor", about)]
struct Cli {
    /// Path to the YAML configuration file (falls back to $CONFIG_PATH).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string.
    pub fn full() -> String {
        format!("{} (commit: {})", RELEASE, git_commit())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("dnstap-processor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // The flag wins; the deployment usually sets CONFIG_PATH instead.
    let config_path = cli.config.or_else(|| {
        std::env::var("CONFIG_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    });

    let cfg = Config::load(config_path.as_deref()).context("loading configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        node = %cfg.node_name,
        dnstap_socket = %cfg.dnstap_socket.display(),
        protobuf_listen = %cfg.protobuf_listen,
        primary = %cfg.primary.url,
        buffer = %cfg.buffer.path.display(),
        "starting dnstap-processor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::start(cfg).await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: final flush, buffer release.
    agent.stop().await?;

    tracing::info!("dnstap-processor stopped");

    Ok(())
}
