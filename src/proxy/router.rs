use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::pool::{BackendPool, PoolOptions};
use crate::com::ProxyError;
use crate::proxy::slots::{Slot, SlotRouting};
use crate::topology::SlotRecord;
use crate::utils::{crc16, trim_hash_tag};

/// Default number of hash slots a keyspace shards into.
pub const DEFAULT_SLOT_COUNT: usize = 1024;

/// Key-to-slot mapping plus maintenance of the slot table.
///
/// Pools are shared across slots through a registry keyed by address so
/// that a backend serving many slots gets one connection set; pools that
/// no longer appear in any routing decision are closed after a snapshot
/// lands.
pub struct Router {
    cluster: Arc<str>,
    hash_tag: Vec<u8>,
    slots: Vec<Arc<Slot>>,
    pools: Mutex<HashMap<Arc<str>, Arc<BackendPool>>>,
    pool_options: PoolOptions,
}

impl Router {
    pub fn new(
        cluster: Arc<str>,
        slot_count: usize,
        hash_tag: Vec<u8>,
        pool_options: PoolOptions,
    ) -> Router {
        let slot_count = slot_count.max(1);
        Router {
            cluster,
            hash_tag,
            slots: (0..slot_count).map(|id| Arc::new(Slot::new(id))).collect(),
            pools: Mutex::new(HashMap::new()),
            pool_options,
        }
    }

    pub fn cluster(&self) -> &Arc<str> {
        &self.cluster
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Map a key to its slot.
    pub fn slot_for_key(&self, key: &[u8]) -> Arc<Slot> {
        let trimmed = trim_hash_tag(key, &self.hash_tag);
        let id = usize::from(crc16(trimmed)) % self.slots.len();
        self.slots[id].clone()
    }

    pub fn slot(&self, id: usize) -> Option<Arc<Slot>> {
        self.slots.get(id).cloned()
    }

    /// Apply a topology snapshot.
    ///
    /// Each listed record replaces its slot's routing atomically under
    /// the slot's write lock; the swap is prompt and new requests route
    /// to the new pools immediately. The call returns only after the
    /// replaced decisions' in-flight requests have drained, and pools
    /// left unreferenced by the new table are closed at the end.
    pub async fn apply_snapshot(&self, records: &[SlotRecord]) -> Result<(), ProxyError> {
        for record in records {
            let slot = self.slots.get(record.id).ok_or_else(|| {
                ProxyError::BadRequest(format!(
                    "slot id {} out of range (slot count {})",
                    record.id,
                    self.slots.len()
                ))
            })?;
            let routing = self.build_routing(record)?;
            debug!(
                cluster = %self.cluster,
                slot = record.id,
                backend = %record.backend_addr,
                migrate = record.migrate_addr.as_deref().unwrap_or("-"),
                state = %record.action.state,
                "filling slot"
            );
            let previous = slot.fill(routing).await;
            drop(previous);
        }
        self.sweep_unused_pools().await;
        Ok(())
    }

    fn build_routing(&self, record: &SlotRecord) -> Result<SlotRouting, ProxyError> {
        let backend = match record.backend_addr.as_str() {
            "" => None,
            addr => Some(self.pool_for(addr)?),
        };
        let migrate = match record.migrate_addr.as_deref() {
            None | Some("") => None,
            Some(addr) => Some(self.pool_for(addr)?),
        };
        let replica_groups = record
            .replica_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|addr| self.pool_for(addr))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SlotRouting {
            backend,
            migrate,
            replica_groups,
            ..Default::default()
        })
    }

    fn pool_for(&self, addr: &str) -> Result<Arc<BackendPool>, ProxyError> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(addr) {
            return Ok(pool.clone());
        }
        info!(cluster = %self.cluster, backend = %addr, "opening backend pool");
        let pool = Arc::new(BackendPool::connect(
            &self.cluster,
            addr,
            &self.pool_options,
        )?);
        pools.insert(addr.into(), pool.clone());
        Ok(pool)
    }

    /// Close and forget pools no routing decision references anymore.
    async fn sweep_unused_pools(&self) {
        let mut referenced: HashSet<String> = HashSet::new();
        for slot in &self.slots {
            let routing = slot.routing().await;
            for pool in routing.pools() {
                referenced.insert(pool.addr().to_string());
            }
        }

        let mut dropped = Vec::new();
        {
            let mut pools = self.pools.lock();
            pools.retain(|addr, pool| {
                if referenced.contains(addr.as_ref()) {
                    true
                } else {
                    dropped.push(pool.clone());
                    false
                }
            });
        }
        for pool in dropped {
            info!(cluster = %self.cluster, backend = %pool.addr(), "closing retired backend pool");
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(slot_count: usize) -> Router {
        Router::new(
            "test".into(),
            slot_count,
            b"{}".to_vec(),
            PoolOptions {
                databases: 1,
                parallel: 1,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn key_mapping_is_stable_and_tag_aware() {
        let router = router(DEFAULT_SLOT_COUNT);
        let direct = router.slot_for_key(b"user1000");
        let tagged = router.slot_for_key(b"{user1000}.tail");
        assert_eq!(direct.id(), tagged.id());
        assert_eq!(
            direct.id(),
            usize::from(crc16(b"user1000")) % DEFAULT_SLOT_COUNT
        );
    }

    #[tokio::test]
    async fn snapshot_rejects_out_of_range_ids() {
        let router = router(4);
        let record = SlotRecord {
            id: 9,
            backend_addr: "127.0.0.1:6379".into(),
            ..Default::default()
        };
        assert!(router.apply_snapshot(&[record]).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_installs_backends_and_shares_pools() {
        let router = router(4);
        let records: Vec<SlotRecord> = (0..4)
            .map(|id| SlotRecord {
                id,
                backend_addr: "127.0.0.1:16379".into(),
                ..Default::default()
            })
            .collect();
        router.apply_snapshot(&records).await.unwrap();

        let a = router.slot(0).unwrap();
        let b = router.slot(3).unwrap();
        let pool_a = a.routing().await.backend.clone().unwrap();
        let pool_b = b.routing().await.backend.clone().unwrap();
        assert!(Arc::ptr_eq(&pool_a, &pool_b));
    }

    #[tokio::test]
    async fn swapped_out_pools_are_closed() {
        use std::time::Duration;

        use crate::backend::conn::ConnState;

        let router = router(1);
        let to_a = SlotRecord {
            id: 0,
            backend_addr: "127.0.0.1:16380".into(),
            ..Default::default()
        };
        let to_b = SlotRecord {
            id: 0,
            backend_addr: "127.0.0.1:16381".into(),
            ..Default::default()
        };
        router.apply_snapshot(&[to_a]).await.unwrap();
        let old = router.slot(0).unwrap().routing().await.backend.clone().unwrap();
        let old_conn = old.conn(0, 0, true).unwrap();
        router.apply_snapshot(&[to_b]).await.unwrap();

        assert_eq!(
            router.slot(0).unwrap().routing().await.backend.as_ref().unwrap().addr(),
            "127.0.0.1:16381"
        );
        assert_eq!(router.pools.lock().len(), 1);
        tokio::time::timeout(
            Duration::from_secs(2),
            old_conn.wait_state(ConnState::Closed),
        )
        .await
        .expect("retired pool connections must close");
    }
}
