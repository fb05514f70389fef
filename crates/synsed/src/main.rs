//! synsed - synse gateway daemon
//!
//! Loads the gateway configuration, registers the configured plugins and
//! runs the refresh and transaction sweep loops until interrupted.
//!
//! Usage:
//!   synsed [OPTIONS] <config.toml>

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use synse_core::TransportKind;
use synse_gateway::{Gateway, GatewayConfig, MemoryConnector, TracingMetrics, TransportConnector};
use synse_plugin_http::HttpConnector;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connection timeout for HTTP plugins
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "synsed")]
#[command(author, version, about = "synse plugin gateway daemon")]
struct Args {
    /// Gateway configuration file (TOML)
    #[arg(env = "SYNSED_CONFIG")]
    config: PathBuf,

    /// Discover an HTTP plugin at this address on startup (repeatable)
    #[arg(short, long = "discover", value_name = "URL")]
    discover: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "synsed=info,synse_gateway=info,synse_plugin_http=info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: GatewayConfig = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    tracing::info!("Starting synsed (synse gateway daemon)");
    tracing::info!("Loading config from: {}", args.config.display());
    let config = load_config(&args.config)?;

    // In-process plugins are supplied by embedding code; the daemon has none
    let connector = TransportConnector::new()
        .with(
            TransportKind::Http,
            Arc::new(HttpConnector::new(config.rpc.timeout(), CONNECT_TIMEOUT)),
        )
        .with(TransportKind::Memory, Arc::new(MemoryConnector::new()));

    let gateway = Gateway::new(config, Arc::new(connector), Arc::new(TracingMetrics))?;

    for address in &args.discover {
        match gateway.discover(address, TransportKind::Http).await {
            Ok(descriptor) => {
                tracing::info!(plugin_id = %descriptor.id, address = %address, "Plugin discovered")
            }
            Err(e) => tracing::warn!(address = %address, error = %e, "Plugin discovery failed"),
        }
    }

    for plugin in gateway.dispatcher().plugins() {
        tracing::info!(
            plugin_id = %plugin.id,
            address = %plugin.address,
            transport = %plugin.transport,
            "Plugin registered"
        );
    }

    gateway.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    gateway.shutdown();

    Ok(())
}
