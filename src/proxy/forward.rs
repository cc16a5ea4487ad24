use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::debug;

use crate::backend::conn::BackendConn;
use crate::backend::pool::BackendPool;
use crate::com::ProxyError;
use crate::metrics;
use crate::protocol::resp::Resp;
use crate::proxy::request::Request;
use crate::proxy::slots::{Slot, SlotRouting};

/// Timeout argument of the single-key migrate command, milliseconds.
const MIGRATE_TIMEOUT_ARG: &[u8] = b"3000";

/// Which forwarding strategy a cluster runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardKind {
    #[default]
    Sync,
    SemiAsync,
}

/// Decide a backend connection for a request and enqueue it.
#[async_trait]
pub trait ForwardMethod: Send + Sync {
    fn kind(&self) -> ForwardKind;

    async fn forward(&self, slot: &Slot, request: Request, hkey: &[u8])
        -> Result<(), ProxyError>;
}

pub fn forward_method(kind: ForwardKind, cluster: Arc<str>) -> Arc<dyn ForwardMethod> {
    match kind {
        ForwardKind::Sync => Arc::new(ForwardSync),
        ForwardKind::SemiAsync => Arc::new(ForwardSemiAsync { cluster }),
    }
}

/// Synchronous strategy: while the slot is migrating, force the
/// referenced key across with a blocking single-key migrate before the
/// command is dispatched to the destination.
pub struct ForwardSync;

#[async_trait]
impl ForwardMethod for ForwardSync {
    fn kind(&self) -> ForwardKind {
        ForwardKind::Sync
    }

    async fn forward(
        &self,
        slot: &Slot,
        request: Request,
        hkey: &[u8],
    ) -> Result<(), ProxyError> {
        // The read lock stays held across the migrate subrequest so the
        // migrate is ordered before any topology swap and before later
        // requests to the same slot.
        let routing = slot.routing().await;
        let conn = process_sync(slot, &routing, &request, hkey).await?;
        drop(routing);
        conn.push_back(request);
        Ok(())
    }
}

async fn process_sync(
    slot: &Slot,
    routing: &SlotRouting,
    request: &Request,
    hkey: &[u8],
) -> Result<BackendConn, ProxyError> {
    let backend = routing.backend.as_ref().ok_or_else(|| {
        debug!(slot = slot.id(), "slot has no primary backend");
        ProxyError::SlotNotReady
    })?;

    if let Some(source) = routing.migrate.as_ref() {
        if !hkey.is_empty() {
            migrate_one(slot, backend, source, request, hkey).await?;
        }
    }

    let conn = select_conn(routing, request).ok_or(ProxyError::SlotNotReady)?;
    request.join_group(routing.refs.clone());
    Ok(conn)
}

/// Semi-asynchronous strategy for multi-key commands: the wrapper command
/// atomically migrates the referenced key bundle and either tells us to
/// dispatch to the destination, to retry later, or answers the command on
/// the source outright.
pub struct ForwardSemiAsync {
    cluster: Arc<str>,
}

#[async_trait]
impl ForwardMethod for ForwardSemiAsync {
    fn kind(&self) -> ForwardKind {
        ForwardKind::SemiAsync
    }

    async fn forward(
        &self,
        slot: &Slot,
        request: Request,
        hkey: &[u8],
    ) -> Result<(), ProxyError> {
        let mut attempt: u32 = 0;
        loop {
            let step = {
                let routing = slot.routing().await;
                process_semi_async(slot, &routing, &request, hkey).await?
            };
            match step {
                Step::Enqueue(conn) => {
                    conn.push_back(request);
                    return Ok(());
                }
                Step::Answered => return Ok(()),
                Step::Retry => {
                    metrics::migrate_retry_incr(&self.cluster);
                    let delay = retry_delay(attempt);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    if request.is_broken() {
                        return Err(ProxyError::RequestBroken);
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

enum Step {
    Enqueue(BackendConn),
    Answered,
    Retry,
}

/// Backoff ladder of the semi-async retry loop: immediate for the first
/// five attempts, then one millisecond per attempt, capped at twenty.
fn retry_delay(attempt: u32) -> Duration {
    match attempt {
        0..=4 => Duration::ZERO,
        5..=19 => Duration::from_millis(u64::from(attempt)),
        _ => Duration::from_millis(20),
    }
}

async fn process_semi_async(
    slot: &Slot,
    routing: &SlotRouting,
    request: &Request,
    hkey: &[u8],
) -> Result<Step, ProxyError> {
    if routing.backend.is_none() {
        debug!(slot = slot.id(), "slot has no primary backend");
        return Err(ProxyError::SlotNotReady);
    }

    if let Some(source) = routing.migrate.as_ref() {
        if !hkey.is_empty() {
            match migrate_exec_wrapper(slot, source, request, hkey).await? {
                WrapperVerdict::Moved => {}
                WrapperVerdict::NotYet => return Ok(Step::Retry),
                WrapperVerdict::Answered(reply) => {
                    request.set_reply(reply);
                    return Ok(Step::Answered);
                }
            }
        }
    }

    let conn = select_conn(routing, request).ok_or(ProxyError::SlotNotReady)?;
    request.join_group(routing.refs.clone());
    Ok(Step::Enqueue(conn))
}

/// Choose the target connection: replicas may serve reads while no
/// migration is in progress, everything else goes to the primary.
fn select_conn(routing: &SlotRouting, request: &Request) -> Option<BackendConn> {
    let database = request.database();
    let seed = request.seed16();

    if routing.migrate.is_none() && request.is_read_only() && !routing.replica_groups.is_empty() {
        for group in &routing.replica_groups {
            let mut index = seed;
            for _ in 0..group.len() {
                index = (index + 1) % group.len();
                if let Some(conn) = group[index].conn(database, seed, false) {
                    return Some(conn);
                }
            }
        }
    }

    routing.backend.as_ref()?.conn(database, seed, true)
}

/// Issue `SLOTSMGRTTAGONE dest_host dest_port timeout hkey` against the
/// migration source and await its integer reply.
async fn migrate_one(
    slot: &Slot,
    dest: &Arc<BackendPool>,
    source: &Arc<BackendPool>,
    request: &Request,
    hkey: &[u8],
) -> Result<(), ProxyError> {
    let multi = vec![
        Resp::Bulk(Bytes::from_static(b"SLOTSMGRTTAGONE")),
        Resp::Bulk(dest.host()),
        Resp::Bulk(dest.port()),
        Resp::Bulk(Bytes::from_static(MIGRATE_TIMEOUT_ARG)),
        Resp::Bulk(Bytes::copy_from_slice(hkey)),
    ];
    let migrate = Request::internal(multi, request.database());

    let conn = source
        .conn(migrate.database(), request.seed16(), true)
        .ok_or(ProxyError::SlotNotReady)?;
    conn.push_back(migrate.clone());
    migrate.wait().await;

    if let Some(err) = migrate.take_error() {
        debug!(
            slot = slot.id(),
            from = %source.addr(),
            to = %dest.addr(),
            error = %err,
            "single-key migrate failed"
        );
        return Err(err);
    }
    match migrate.take_reply() {
        None => Err(ProxyError::RespIsRequired),
        Some(Resp::Error(text)) => Err(ProxyError::BadMigrateResp(
            String::from_utf8_lossy(&text).into_owned(),
        )),
        Some(Resp::Integer(moved)) => {
            debug!(
                slot = slot.id(),
                from = %source.addr(),
                to = %dest.addr(),
                keys = moved,
                "migrated hash key"
            );
            Ok(())
        }
        Some(other) => Err(ProxyError::BadMigrateResp(format!(
            "should be integer, but got {}",
            other.kind_name()
        ))),
    }
}

enum WrapperVerdict {
    /// Tag 0: the key bundle moved, dispatch to the destination.
    Moved,
    /// Tag 1: the source could not proceed, retry later.
    NotYet,
    /// Tag 2: the source executed the command; this is the reply.
    Answered(Resp),
}

/// Issue `SLOTSMGRT-EXEC-WRAPPER hkey cmd [arg...]` against the migration
/// source and interpret its two-element reply.
async fn migrate_exec_wrapper(
    slot: &Slot,
    source: &Arc<BackendPool>,
    request: &Request,
    hkey: &[u8],
) -> Result<WrapperVerdict, ProxyError> {
    let mut multi = Vec::with_capacity(2 + request.multi().len());
    multi.push(Resp::Bulk(Bytes::from_static(b"SLOTSMGRT-EXEC-WRAPPER")));
    multi.push(Resp::Bulk(Bytes::copy_from_slice(hkey)));
    multi.extend_from_slice(request.multi());
    let wrapper = Request::internal(multi, request.database());

    let conn = source
        .conn(wrapper.database(), request.seed16(), true)
        .ok_or(ProxyError::SlotNotReady)?;
    conn.push_back(wrapper.clone());
    wrapper.wait().await;

    if let Some(err) = wrapper.take_error() {
        debug!(
            slot = slot.id(),
            from = %source.addr(),
            error = %err,
            "migrate wrapper failed"
        );
        return Err(err);
    }
    let reply = wrapper.take_reply().ok_or(ProxyError::RespIsRequired)?;
    match reply {
        Resp::Error(text) => Err(ProxyError::BadMigrateResp(
            String::from_utf8_lossy(&text).into_owned(),
        )),
        Resp::Array(items) => {
            let [tag, payload]: [Resp; 2] = items.try_into().map_err(|items: Vec<Resp>| {
                ProxyError::BadMigrateResp(format!("array of {} elements", items.len()))
            })?;
            match tag.as_integer() {
                Some(0) => Ok(WrapperVerdict::Moved),
                Some(1) => Ok(WrapperVerdict::NotYet),
                Some(2) => Ok(WrapperVerdict::Answered(payload)),
                Some(other) => Err(ProxyError::BadMigrateResp(format!("unknown tag {other}"))),
                None => Err(ProxyError::BadMigrateResp(format!(
                    "tag should be integer, but got {}",
                    tag.kind_name()
                ))),
            }
        }
        other => Err(ProxyError::BadMigrateResp(format!(
            "should be array, but got {}",
            other.kind_name()
        ))),
    }
}
