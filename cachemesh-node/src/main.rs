// CacheMesh node binary
// Loads and validates configuration, starts the node, stops on ctrl-c

use cachemesh_core::config::NodeConfig;
use cachemesh_node::CacheNode;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            info!("loading configuration from {}", path);
            NodeConfig::from_file(&path)
                .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?
        }
        None => NodeConfig::default(),
    };
    config.apply_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let node = CacheNode::new(config)?;
    let addr = node.start().await?;
    info!(%addr, "cachemesh ready; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
