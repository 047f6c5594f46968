use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use gantry::storage::InMemoryStore;
use gantry::{Config, Gateway};

/// Gantry — API gateway
#[derive(Parser)]
#[command(name = "gantry", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gantry.conf")]
    config: String,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Gantry v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        Config::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }

    let store = Arc::new(InMemoryStore::new());
    let gateway = Gateway::new(config, store)?;
    let _handles = gateway.clone().start().await?;

    // watch the app directory so external edits reload too
    let _watcher = match gantry::reload::watch_app_dir(
        gateway.config.app_path.clone(),
        gateway.coordinator.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to start app-dir watcher, hot reload on file change disabled");
            None
        }
    };

    tracing::info!("Gateway ready — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
