//! Spiron Node binary
//!
//! A leaderless replica that converges with its peers by gossip.

use spiron_node::{NodeConfig, SpironNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spiron_node=info,spiron=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Spiron Node");

    let config = NodeConfig::from_env()?;
    let node = SpironNode::new(config)?;

    node.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    })
    .await?;

    Ok(())
}
