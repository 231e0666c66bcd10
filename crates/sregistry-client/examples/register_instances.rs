//! Register three instances of `test`, list them, then deregister on exit.
//!
//! Server address and credentials come from `SREGISTRY_*` environment
//! variables, e.g.
//!
//! ```text
//! SREGISTRY_SERVER_ADDR=http://127.0.0.1:8848 \
//! SREGISTRY_ACCESS_KEY=nacos SREGISTRY_SECRET_KEY=nacos \
//! cargo run --example register_instances
//! ```

use sregistry_client::{ClientConfig, NamingService};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "test";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env();
    info!(config = ?config, "Connecting to registry");
    let naming = NamingService::new(config)?;

    for ip in ["127.0.0.1", "127.0.0.2", "127.0.0.3"] {
        naming.register_instance(SERVICE_NAME, ip, 8848).await?;
    }

    let snapshot = naming.get_instances(SERVICE_NAME, true).await?;
    for instance in &snapshot.instances {
        info!(ip = %instance.ip, port = instance.port, weight = instance.weight, "Instance");
    }

    info!("Heartbeating; press Ctrl-C to deregister and exit");
    tokio::signal::ctrl_c().await?;

    naming.shutdown().await;
    Ok(())
}
