//! Discover Agent - bootstraps a discover application.
//!
//! This daemon:
//! - Registers the application with the policy engine
//! - Downloads its messaging certificates
//! - Connects to every datasource reported by the connection manager
//! - Builds the mTLS producer and consumer toward the broker

mod config;
mod error;

use clap::Parser;
use config::Config;
use discover_agent_lib::DiscoverApplication;
use discover_agent_lib::connections::RusshSftpClient;
use discover_agent_lib::mount::SystemMountService;
use error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Discover application bootstrap agent
#[derive(Parser, Debug)]
#[command(name = "discover-agent")]
#[command(about = "Registers a discover application and prepares its datasources")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DISCOVER_CONFIG")]
    config: Option<PathBuf>,

    /// Replace an existing registration with this application's info
    #[arg(long)]
    update_registration: bool,

    /// Log level when RUST_LOG is not set (e.g. debug, info)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&config.data_dir(), &log_level)?;

    info!("Starting discover-agent");
    if let Err(e) = run(&args, &config).await {
        error!("discover-agent failed: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn run(args: &Args, config: &Config) -> Result<()> {
    let env = |key: &str| std::env::var(key).ok();
    let bootstrap = config.bootstrap_config(&env)?;

    debug!("Application: {}", bootstrap.identity.name());
    debug!("Deployment mode: {:?}", bootstrap.identity.mode());
    debug!(
        "Registration endpoint: {}",
        bootstrap.identity.endpoints().registration
    );
    debug!("Certificates dir: {}", bootstrap.identity.certs_dir().display());

    let mut app = DiscoverApplication::new(
        bootstrap,
        Arc::new(SystemMountService),
        Arc::new(RusshSftpClient::new(config.ssh_timeout())),
    )?;

    let update = args.update_registration || config.application.update_registration;
    if let Err(e) = app.start(update).await {
        if e.is_auth_error() {
            error!("Platform rejected the application credentials; check DISCOVER_CREDENTIALS__USER and DISCOVER_CREDENTIALS__PASSWORD");
        }
        return Err(e.into());
    }

    let state = app.state();
    info!(
        "Connected {} datasource(s): {}",
        state.connections.len(),
        state
            .connections
            .iter()
            .map(|(key, conn)| format!("{key} ({})", conn.kind()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let transport = state
        .transport
        .as_ref()
        .ok_or(Error::TransportMissing)?
        .instantiate()?;
    info!(
        "Messaging ready on {} (work: {}, completion: {})",
        state
            .transport
            .as_ref()
            .map(|t| t.endpoint.to_string())
            .unwrap_or_default(),
        transport.work_queue,
        transport.completion_queue
    );

    shutdown_signal().await;
    info!("Shutdown signal received");
    app.stop().await;
    drop(transport);
    info!("Graceful shutdown complete");
    Ok(())
}

/// Crates whose info-level chatter drowns the bootstrap log.
const QUIET_TARGETS: &[&str] = &[
    "russh",
    "hyper",
    "reqwest",
    "h2",
    "rustls",
    "rdkafka",
    "aws_config",
    "aws_smithy_runtime",
];

/// Filter directives: quiet dependencies, then `RUST_LOG` or the configured level.
fn log_directives(level: &str, rust_log: Option<&str>) -> String {
    let mut directives: Vec<String> = QUIET_TARGETS.iter().map(|t| format!("{t}=warn")).collect();
    directives.push(rust_log.unwrap_or(level).to_string());
    directives.join(",")
}

/// Log to stdout and to a daily file under `<data_dir>/logs`.
fn init_logging(data_dir: &Path, level: &str) -> anyhow::Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("discover-agent")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    // The writer flushes for as long as the process runs.
    std::mem::forget(guard);

    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::new(log_directives(level, rust_log.as_deref()));

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("Writing logs to {}", log_dir.display());
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
