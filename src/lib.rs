pub mod backend;
pub mod com;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod topology;
pub mod utils;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub use com::ProxyError;
pub use config::Config;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start every configured cluster plus the metrics exporter and run until
/// one of them stops.
pub async fn run(config: Config) -> Result<()> {
    if let Some(addr) = config.metrics_addr.clone() {
        let addr = addr
            .parse()
            .with_context(|| format!("invalid metrics_addr {addr}"))?;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve_exporter(addr).await {
                warn!(error = %err, "metrics exporter stopped");
            }
        });
    }

    let mut clusters = Vec::new();
    for cluster in config.clusters() {
        info!(
            cluster = %cluster.name,
            addr = %cluster.listen_addr,
            forward = ?cluster.forward,
            "starting cluster"
        );
        clusters.push(tokio::spawn(proxy::run_cluster(cluster.clone())));
    }

    for handle in clusters {
        handle.await.context("cluster task panicked")??;
    }
    Ok(())
}
