use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relaycore::config::{Cli, load_config};
use relaycore::provider::NetworkProvider;
use relaycore::provider::netns::NetnsNetworkProvider;
use relaycore::provider::os::OsNetworkProvider;
use relaycore::supervisor::ProxySupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let channels = load_config(&cli)?;
    if channels.is_empty() {
        tracing::warn!("no channels configured");
        return Ok(());
    }

    let provider: Arc<dyn NetworkProvider> = match cli.netns.as_deref() {
        Some(ns) => Arc::new(NetnsNetworkProvider::named(ns)),
        None => Arc::new(OsNetworkProvider::new()),
    };

    let supervisor = ProxySupervisor::start(provider, channels).await?;
    tracing::info!(relays = supervisor.relay_count(), "relay daemon running");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl_c");
    tracing::info!("ctrl_c received; shutting down");
    supervisor.shutdown().await?;
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .unwrap_or_else(EnvFilter::from_default_env);
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
