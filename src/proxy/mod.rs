pub mod forward;
pub mod frontend;
pub mod queue;
pub mod request;
pub mod router;
pub mod slots;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::pool::PoolOptions;
use crate::com::ProxyError;
use crate::config::ClusterConfig;
use crate::proxy::forward::{forward_method, ForwardMethod};
use crate::proxy::frontend::FrontendSession;
use crate::proxy::router::Router;
use crate::topology::{SlotRecord, StaticTopology, TopologyStore};

/// One cluster's forwarding engine: the slot router, the strategy, and
/// the accept loop feeding sessions into both.
pub struct Proxy {
    cluster: Arc<str>,
    router: Arc<Router>,
    forward: Arc<dyn ForwardMethod>,
    databases: u32,
}

impl Proxy {
    pub fn new(config: &ClusterConfig) -> Arc<Proxy> {
        let cluster: Arc<str> = config.name.as_str().into();
        let pool_options = PoolOptions {
            databases: config.databases,
            parallel: config.backend_parallel,
            connect_timeout: config.connect_timeout(),
        };
        let router = Arc::new(Router::new(
            cluster.clone(),
            config.slot_count,
            config.hash_tag_bytes(),
            pool_options,
        ));
        Arc::new(Proxy {
            forward: forward_method(config.forward, cluster.clone()),
            cluster,
            router,
            databases: config.databases,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn apply_topology(&self, records: &[SlotRecord]) -> Result<(), ProxyError> {
        self.router.apply_snapshot(records).await
    }

    /// Re-apply the slot table whenever the store replaces it.
    pub fn watch_topology(
        self: &Arc<Self>,
        mut updates: watch::Receiver<Vec<SlotRecord>>,
    ) -> JoinHandle<()> {
        let proxy = self.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let records = updates.borrow_and_update().clone();
                info!(cluster = %proxy.cluster, slots = records.len(), "topology update received");
                if let Err(err) = proxy.apply_topology(&records).await {
                    warn!(cluster = %proxy.cluster, error = %err, "failed to apply topology update");
                }
            }
        })
    }

    /// Accept clients forever, one session task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener
                .accept()
                .await
                .context("failed to accept client connection")?;
            debug!(cluster = %self.cluster, %peer, "client connected");
            let session = FrontendSession::new(
                self.cluster.clone(),
                self.router.clone(),
                self.forward.clone(),
                self.databases,
            );
            tokio::spawn(async move {
                if let Err(err) = session.handle(socket).await {
                    debug!(%peer, error = %err, "session ended with error");
                }
            });
        }
    }
}

/// Bring up one configured cluster and serve it.
pub async fn run_cluster(config: ClusterConfig) -> Result<()> {
    let proxy = Proxy::new(&config);
    let store = StaticTopology::new(config.slots.clone());
    let snapshot = store.snapshot().await?;
    proxy
        .apply_topology(&snapshot)
        .await
        .with_context(|| format!("initial topology for cluster {}", config.name))?;
    let _watcher = proxy.watch_topology(store.subscribe());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(cluster = %config.name, addr = %config.listen_addr, "proxy listening");
    proxy.serve(listener).await
}
