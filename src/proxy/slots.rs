use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::backend::pool::BackendPool;
use crate::utils::wait::WaitGroup;

/// Where one slot's traffic goes.
///
/// `refs` counts in-flight requests routed through this particular
/// decision; forwarders join it under the read lock, so once a swap
/// replaces the decision the count can only fall.
pub struct SlotRouting {
    /// Primary backend. `None` while the slot is offline.
    pub backend: Option<Arc<BackendPool>>,
    /// Backend currently donating the slot's keys during a rebalance.
    pub migrate: Option<Arc<BackendPool>>,
    /// Read-only replica groups for load-shedding reads.
    pub replica_groups: Vec<Vec<Arc<BackendPool>>>,
    /// In-flight requests pinned to these pools.
    pub refs: Arc<WaitGroup>,
}

impl Default for SlotRouting {
    fn default() -> Self {
        Self {
            backend: None,
            migrate: None,
            replica_groups: Vec::new(),
            refs: Arc::new(WaitGroup::new()),
        }
    }
}

impl SlotRouting {
    /// Every pool referenced by this routing decision.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<BackendPool>> {
        self.backend
            .iter()
            .chain(self.migrate.iter())
            .chain(self.replica_groups.iter().flatten())
    }
}

/// One shard of the keyspace.
///
/// The routing decision is read under the read lock and replaced under
/// the write lock; readers never observe a partially swapped slot.
pub struct Slot {
    id: usize,
    routing: RwLock<SlotRouting>,
}

impl Slot {
    pub fn new(id: usize) -> Slot {
        Slot {
            id,
            routing: RwLock::new(SlotRouting::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Read the routing decision. Forwarders hold this guard for the
    /// whole routing step, including the synchronous migrate subrequest.
    pub async fn routing(&self) -> RwLockReadGuard<'_, SlotRouting> {
        self.routing.read().await
    }

    /// Swap in a new routing decision and wait out the old one.
    ///
    /// The swap itself is brief: take the write lock, replace, release.
    /// Only then does this wait for the previous decision's in-flight
    /// requests to drain, with routing already flowing to the new pools,
    /// and hand back the previous decision so its pools can be closed.
    pub async fn fill(&self, routing: SlotRouting) -> SlotRouting {
        let previous = {
            let mut guard = self.routing.write().await;
            std::mem::replace(&mut *guard, routing)
        };
        previous.refs.wait().await;
        previous
    }
}
