use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Countdown group: `wait` resolves once the count returns to zero.
///
/// A fresh group holds a count of zero, so waiting on a group nothing has
/// joined returns immediately. This is the completion signal attached to
/// every request (the batch) and the in-flight counter pinning a slot
/// against topology swaps (the group).
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    zeroed: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "wait group count went negative");
        if prev == 1 {
            self.zeroed.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolve once the count reaches zero.
    ///
    /// The notified future is created before the count is inspected, which
    /// closes the window where a final `done` could slip between the check
    /// and the await.
    pub async fn wait(&self) {
        loop {
            let zeroed = self.zeroed.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            zeroed.await;
        }
    }
}
