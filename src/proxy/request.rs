use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::com::ProxyError;
use crate::metrics::Tracker;
use crate::protocol::ops::OpFlag;
use crate::protocol::resp::Resp;
use crate::utils::wait::WaitGroup;

const GOLDEN_RATIO_PRIME_32: u32 = 0x9e37_0001;

/// Hook merging subrequest outcomes into the parent once the batch drains.
pub type CoalesceFn = Box<dyn FnOnce(&Request) -> Result<(), ProxyError> + Send>;

/// One unit of work flowing through the proxy.
///
/// The handle is a cheap clone over shared state: the session keeps one
/// clone to await and encode the outcome, the backend connection keeps
/// another while the command is in flight. The batch is the only
/// synchronization edge between the two.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    multi: Vec<Resp>,
    op_str: Bytes,
    flags: OpFlag,
    database: u32,
    unix_nano: i64,
    id: u64,

    broken: Arc<AtomicBool>,
    batch: Arc<WaitGroup>,
    group: Mutex<Option<Arc<WaitGroup>>>,
    done: AtomicBool,

    outcome: Mutex<Outcome>,
    coalesce: Mutex<Option<CoalesceFn>>,
    remote_tracker: Mutex<Option<Tracker>>,
}

#[derive(Default)]
struct Outcome {
    reply: Option<Resp>,
    error: Option<ProxyError>,
}

fn next_request_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn unix_nano() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Request {
    /// A client command decoded by a session.
    pub fn new(
        multi: Vec<Resp>,
        op_str: Bytes,
        flags: OpFlag,
        database: u32,
        broken: Arc<AtomicBool>,
    ) -> Request {
        Self::build(multi, op_str, flags, database, broken, Arc::new(WaitGroup::new()))
    }

    /// A command issued by the proxy itself (migration subrequests).
    pub fn internal(multi: Vec<Resp>, database: u32) -> Request {
        let op_str = multi
            .first()
            .and_then(Resp::as_bytes)
            .cloned()
            .unwrap_or_else(Bytes::new);
        Self::build(
            multi,
            op_str,
            OpFlag::empty(),
            database,
            Arc::new(AtomicBool::new(false)),
            Arc::new(WaitGroup::new()),
        )
    }

    fn build(
        multi: Vec<Resp>,
        op_str: Bytes,
        flags: OpFlag,
        database: u32,
        broken: Arc<AtomicBool>,
        batch: Arc<WaitGroup>,
    ) -> Request {
        Request {
            inner: Arc::new(Inner {
                multi,
                op_str,
                flags,
                database,
                unix_nano: unix_nano(),
                id: next_request_id(),
                broken,
                batch,
                group: Mutex::new(None),
                done: AtomicBool::new(false),
                outcome: Mutex::new(Outcome::default()),
                coalesce: Mutex::new(None),
                remote_tracker: Mutex::new(None),
            }),
        }
    }

    /// Fan this request out into subrequests, one per frame slice.
    ///
    /// Subrequests share the batch, broken flag, opcode, flags, database
    /// and timestamp with the parent; each carries its own frames and id.
    pub fn make_subs(&self, parts: Vec<Vec<Resp>>) -> Vec<Request> {
        parts
            .into_iter()
            .map(|multi| Request {
                inner: Arc::new(Inner {
                    multi,
                    op_str: self.inner.op_str.clone(),
                    flags: self.inner.flags,
                    database: self.inner.database,
                    unix_nano: self.inner.unix_nano,
                    id: next_request_id(),
                    broken: self.inner.broken.clone(),
                    batch: self.inner.batch.clone(),
                    group: Mutex::new(None),
                    done: AtomicBool::new(false),
                    outcome: Mutex::new(Outcome::default()),
                    coalesce: Mutex::new(None),
                    remote_tracker: Mutex::new(None),
                }),
            })
            .collect()
    }

    pub fn multi(&self) -> &[Resp] {
        &self.inner.multi
    }

    pub fn op_str(&self) -> &Bytes {
        &self.inner.op_str
    }

    pub fn flags(&self) -> OpFlag {
        self.inner.flags
    }

    pub fn database(&self) -> u32 {
        self.inner.database
    }

    pub fn unix_nano(&self) -> i64 {
        self.inner.unix_nano
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.flags.is_read_only()
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    /// Per-request seed spreading pipelined reads across replicas and
    /// parallel connections without per-thread state. Derived from the
    /// creation timestamp and the id assigned on decode, both stable for
    /// the request's lifetime.
    pub fn seed16(&self) -> usize {
        let mixed = (self.inner.unix_nano as u32)
            .wrapping_add(self.inner.id as u32)
            .wrapping_mul(GOLDEN_RATIO_PRIME_32);
        (mixed >> 16) as usize
    }

    /// The command as a single wire frame for the backend writer.
    pub fn wire_frame(&self) -> Resp {
        Resp::Array(self.inner.multi.clone())
    }

    /// Await completion of this request and every subrequest sharing its
    /// batch.
    pub async fn wait(&self) {
        self.inner.batch.wait().await
    }

    pub(crate) fn batch_add(&self) {
        self.inner.batch.add(1);
    }

    /// Pin `group` (a slot's in-flight counter) until completion.
    pub(crate) fn join_group(&self, group: Arc<WaitGroup>) {
        group.add(1);
        *self.inner.group.lock() = Some(group);
    }

    pub(crate) fn set_remote_tracker(&self, tracker: Tracker) {
        *self.inner.remote_tracker.lock() = Some(tracker);
    }

    pub fn set_coalesce(&self, hook: CoalesceFn) {
        *self.inner.coalesce.lock() = Some(hook);
    }

    /// Run the coalesce hook, if any. Invoked by the session after the
    /// batch drains.
    pub fn coalesce(&self) -> Result<(), ProxyError> {
        let hook = self.inner.coalesce.lock().take();
        match hook {
            Some(hook) => hook(self),
            None => Ok(()),
        }
    }

    /// Store a reply without releasing the batch.
    ///
    /// Used when the request is answered without ever being handed to a
    /// backend: locally answered commands, coalesced parents, and the
    /// migrate wrapper returning the authoritative reply.
    pub fn set_reply(&self, reply: Resp) {
        self.inner.outcome.lock().reply = Some(reply);
    }

    /// Store an error without releasing the batch; counterpart of
    /// [`Request::set_reply`] for requests that were never enqueued.
    pub fn set_error(&self, error: ProxyError) {
        self.inner.outcome.lock().error = Some(error);
    }

    /// Complete an enqueued request with a backend reply.
    pub fn finish_with_reply(&self, reply: Resp) {
        self.complete(Some(reply), None);
    }

    /// Complete an enqueued request with an error.
    pub fn finish_with_error(&self, error: ProxyError) {
        self.complete(None, Some(error));
    }

    fn complete(&self, reply: Option<Resp>, error: Option<ProxyError>) {
        assert!(
            !self.inner.done.swap(true, Ordering::AcqRel),
            "request completed twice"
        );
        {
            let mut outcome = self.inner.outcome.lock();
            outcome.reply = reply;
            outcome.error = error;
        }
        self.inner.remote_tracker.lock().take();
        if let Some(group) = self.inner.group.lock().take() {
            group.done();
        }
        self.inner.batch.done();
    }

    pub fn take_reply(&self) -> Option<Resp> {
        self.inner.outcome.lock().reply.take()
    }

    pub fn take_error(&self) -> Option<ProxyError> {
        self.inner.outcome.lock().error.take()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("op", &String::from_utf8_lossy(&self.inner.op_str))
            .field("id", &self.inner.id)
            .field("database", &self.inner.database)
            .finish()
    }
}
