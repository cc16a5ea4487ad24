use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;

/// State of the data-movement action attached to a slot record.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SlotAction {
    #[serde(default)]
    pub state: String,
}

/// One row of the slot table as handed over by the topology store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlotRecord {
    pub id: usize,
    #[serde(default)]
    pub backend_addr: String,
    #[serde(default)]
    pub migrate_addr: Option<String>,
    #[serde(default)]
    pub replica_groups: Vec<Vec<String>>,
    #[serde(default)]
    pub action: SlotAction,
}

/// Contract for the external component that owns the slot table: it hands
/// the core a snapshot and notifies when the table is replaced.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Vec<SlotRecord>>;
    fn subscribe(&self) -> watch::Receiver<Vec<SlotRecord>>;
}

/// Topology store backed by an in-memory table, seeded from the cluster
/// configuration. `publish` replaces the table and wakes subscribers;
/// reload paths and tests drive swaps through it.
pub struct StaticTopology {
    records: watch::Sender<Vec<SlotRecord>>,
}

impl StaticTopology {
    pub fn new(records: Vec<SlotRecord>) -> Self {
        let (tx, _rx) = watch::channel(records);
        Self { records: tx }
    }

    pub fn publish(&self, records: Vec<SlotRecord>) {
        self.records.send_replace(records);
    }
}

#[async_trait]
impl TopologyStore for StaticTopology {
    async fn snapshot(&self) -> anyhow::Result<Vec<SlotRecord>> {
        Ok(self.records.borrow().clone())
    }

    fn subscribe(&self) -> watch::Receiver<Vec<SlotRecord>> {
        self.records.subscribe()
    }
}
