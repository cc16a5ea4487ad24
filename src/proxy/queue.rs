use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::com::ProxyError;
use crate::proxy::request::Request;

/// Default capacity kept alive across bursts.
pub const DEFAULT_BACKLOG: usize = 128;

/// Multi-producer/multi-consumer FIFO connecting every producer/consumer
/// pair inside the proxy: sessions feed backend connections through one,
/// and each session pairs its decode and encode halves with another.
///
/// A mutex plus wakeup signal is used instead of a channel because
/// consumers need `buffered()` to decide when to force a flush, and
/// because the drained buffer's capacity is recycled instead of growing
/// without bound across bursts.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    signal: Notify,
}

struct Inner {
    active: VecDeque<Request>,
    spare: VecDeque<Request>,
    waiters: usize,
    closed: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        let backlog = backlog.max(1);
        Self {
            inner: Mutex::new(Inner {
                active: VecDeque::new(),
                spare: VecDeque::with_capacity(backlog),
                waiters: 0,
                closed: false,
            }),
            signal: Notify::new(),
        }
    }

    /// Append a request; returns the new queue length.
    ///
    /// Pushing onto a closed queue is a programming error: the routing
    /// protocol guarantees a connection is only closed once nothing can
    /// route to it anymore.
    pub fn push_back(&self, request: Request) -> usize {
        let mut inner = self.inner.lock();
        assert!(!inner.closed, "push on closed request queue");
        if inner.waiters > 0 {
            self.signal.notify_one();
        }
        inner.active.push_back(request);
        inner.active.len()
    }

    /// Pop the oldest request, waiting for a push when empty. Returns
    /// `None` once the queue is closed and drained. Cancel-safe: a
    /// dropped pop never takes a request with it.
    pub async fn pop_front(&self) -> Option<Request> {
        loop {
            let signalled = self.signal.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(request) = inner.active.pop_front() {
                    // Hand the signal on: a single stored wakeup permit
                    // can stand for several pushes.
                    if !inner.active.is_empty() && inner.waiters > 0 {
                        self.signal.notify_one();
                    }
                    return Some(request);
                }
                if inner.closed {
                    return None;
                }
                // The queue just drained: swap the grown buffer for the
                // spare so burst capacity is reclaimed without allocating.
                let Inner { active, spare, .. } = &mut *inner;
                mem::swap(active, spare);
                inner.waiters += 1;
            }
            let waiting = WaiterGuard { queue: self };
            signalled.await;
            drop(waiting);
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            self.signal.notify_waiters();
        }
    }

    /// Current queue length.
    pub fn buffered(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Pop until the queue closes, handing each request to `on_request`;
    /// stops early when the callback fails.
    pub async fn drain_all<F>(&self, mut on_request: F) -> Result<(), ProxyError>
    where
        F: FnMut(Request) -> Result<(), ProxyError>,
    {
        while let Some(request) = self.pop_front().await {
            on_request(request)?;
        }
        Ok(())
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the waiter count honest even when a blocked pop is cancelled.
struct WaiterGuard<'a> {
    queue: &'a RequestQueue,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.queue.inner.lock().waiters -= 1;
    }
}
