//! Gateway binary entry point.

use anyhow::Result;
use db_gateway::{
    config::GatewayConfigBuilder,
    database::{DescriptorStore, InMemoryDescriptorStore},
    gateway::Gateway,
    protocol::GatewayService,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = GatewayConfigBuilder::new().from_env()?.build()?;

    let store = match &config.connections_file {
        Some(path) => InMemoryDescriptorStore::from_json_file(path)?,
        None => {
            warn!("GATEWAY_CONNECTIONS_FILE not set, every connection id will be unknown");
            InMemoryDescriptorStore::new()
        }
    };
    let store: Arc<dyn DescriptorStore> = Arc::new(store);

    let gateway = Arc::new(Gateway::builder().config(config).store(store).build()?);

    info!("Gateway ready, reading requests from stdin");
    GatewayService::new(gateway).run().await?;

    info!("Gateway shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("db_gateway=info,warn"));

    // JSON logs to stderr; stdout carries responses.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .init();
}
