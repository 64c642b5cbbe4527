use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use virtd_state::{DriverConfig, DriverState};

#[derive(Debug, Parser)]
#[command(name = "virtd")]
#[command(author, version, about = "Hypervisor management daemon", long_about = None)]
pub struct DaemonArgs {
    /// Configuration file overriding the compiled-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the runtime state directory.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Run as a session (unprivileged) instance even when root.
    #[arg(long)]
    pub session: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virtd=info,virtd_state=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(DaemonArgs::parse()).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    let privileged = !args.session && nix::unistd::Uid::effective().is_root();
    info!(privileged, "Starting virtd daemon...");

    let mut config = DriverConfig::new(privileged);
    if let Some(ref path) = args.config {
        config
            .load_overrides(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    } else {
        config.validate().context("Invalid built-in configuration")?;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    std::fs::create_dir_all(&config.state_dir).context("Failed to create state directory")?;
    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

    let pid_file = config.state_dir.join("virtd.pid");
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("Failed to write daemon PID file")?;

    let state_dir = config.state_dir.clone();
    let cache_dir = config.cache_dir.clone();
    let driver = Arc::new(DriverState::new(config));

    info!(
        state_dir = %state_dir.display(),
        cache_dir = %cache_dir.display(),
        "Driver state ready"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    let active = driver.active_count();
    if active > 0 {
        warn!(active, "Shutting down with domains still running");
    }

    if let Err(e) = std::fs::remove_file(&pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove PID file {}: {}", pid_file.display(), e);
        }
    }

    info!("virtd daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
