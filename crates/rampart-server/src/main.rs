//! rampart - HTTP server with multi-layer request admission.

use std::path::PathBuf;

use clap::Parser;
use rampart_server::{ConfigOverrides, RampartServer, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rampart")]
#[command(about = "HTTP server with multi-layer DDoS admission")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "RAMPART_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    cli.overrides.apply(&mut config);

    info!(
        bind = %config.bind_addr,
        trust_forwarded_headers = config.trust_forwarded_headers,
        stats_path = config.stats_path.as_deref().unwrap_or("-"),
        "Starting rampart"
    );

    let server = RampartServer::new(config)?;

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
