use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::com::ProxyError;
use crate::metrics;
use crate::protocol::resp::RespCodec;
use crate::proxy::queue::RequestQueue;
use crate::proxy::request::Request;

/// Lifecycle of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub connect_timeout: Duration,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1_000),
        }
    }
}

const RETRY_BACKOFF_STEP_MS: u64 = 50;
const RETRY_BACKOFF_MAX_MS: u64 = 1_000;

fn retry_backoff(round: u32) -> Duration {
    let millis = RETRY_BACKOFF_STEP_MS
        .saturating_mul(u64::from(round) + 1)
        .min(RETRY_BACKOFF_MAX_MS);
    Duration::from_millis(millis)
}

/// A persistent pipelined connection to one backend instance.
///
/// Requests land on the input queue and are written by the writer half
/// without flushing while more input is pending; the reader half matches
/// each decoded reply to the oldest outstanding request. Both halves run
/// inside a single spawned task for the life of the handle.
#[derive(Clone)]
pub struct BackendConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    cluster: Arc<str>,
    addr: Arc<str>,
    input: RequestQueue,
    state: Mutex<ConnState>,
    state_changed: Notify,
    options: ConnOptions,
}

impl ConnInner {
    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
        self.state_changed.notify_waiters();
    }
}

impl BackendConn {
    /// Create the connection handle and spawn its I/O task.
    pub fn connect(cluster: Arc<str>, addr: Arc<str>, options: ConnOptions) -> BackendConn {
        let conn = BackendConn {
            inner: Arc::new(ConnInner {
                cluster,
                addr,
                input: RequestQueue::new(),
                state: Mutex::new(ConnState::Connecting),
                state_changed: Notify::new(),
                options,
            }),
        };
        tokio::spawn(run(conn.clone()));
        conn
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock()
    }

    /// Live connections are eligible replica targets.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Hand a request to this connection; joins the request's batch.
    pub fn push_back(&self, request: Request) -> usize {
        request.batch_add();
        request.set_remote_tracker(metrics::remote_tracker(&self.inner.cluster));
        self.inner.input.push_back(request)
    }

    /// Stop accepting requests and let the I/O task wind down.
    pub fn close(&self) {
        self.inner.input.close();
    }

    /// Await a particular lifecycle state, mostly useful in tests and
    /// warm-up paths.
    pub async fn wait_state(&self, wanted: ConnState) {
        loop {
            let changed = self.inner.state_changed.notified();
            if self.state() == wanted {
                return;
            }
            changed.await;
        }
    }

    /// Identity comparison for deterministic-selection tests.
    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &BackendConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn open_stream(&self) -> Result<TcpStream, ProxyError> {
        let addr = self.inner.addr.to_string();
        let stream = timeout(
            self.inner.options.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
            .await
            .map_err(|_| {
                ProxyError::from(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Run one connected session; returns `Ok` only when the input queue
    /// closed and every outstanding reply was collected.
    async fn serve(&self, stream: TcpStream) -> Result<(), ProxyError> {
        let input = &self.inner.input;
        let (mut sink, mut frames) = Framed::new(stream, RespCodec).split();
        let outstanding: Mutex<VecDeque<Request>> = Mutex::new(VecDeque::new());

        let write_side = async {
            loop {
                let Some(request) = input.pop_front().await else {
                    sink.flush().await?;
                    return Ok::<(), ProxyError>(());
                };
                outstanding.lock().push_back(request.clone());
                sink.feed(request.wire_frame()).await?;
                // Another request is already buffered: keep pipelining
                // and only flush once the queue runs dry.
                if input.is_empty() {
                    sink.flush().await?;
                }
            }
        };

        let read_side = async {
            loop {
                let frame = match frames.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(ProxyError::from(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backend closed the connection",
                        )))
                    }
                };
                let Some(request) = outstanding.lock().pop_front() else {
                    return Err(ProxyError::UnexpectedReply);
                };
                request.finish_with_reply(frame);
            }
        };

        let end: Result<(), ProxyError> = tokio::select! {
            res = write_side => res,
            res = read_side => res,
        };

        match end {
            // Input closed; collect the replies still owed.
            Ok(()) => loop {
                let Some(request) = outstanding.lock().pop_front() else {
                    return Ok(());
                };
                match frames.next().await {
                    Some(Ok(frame)) => request.finish_with_reply(frame),
                    Some(Err(err)) => {
                        request.finish_with_error(err.clone());
                        fail_all(&outstanding, &err);
                        return Err(err);
                    }
                    None => {
                        let err = ProxyError::from(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backend closed the connection",
                        ));
                        request.finish_with_error(err.clone());
                        fail_all(&outstanding, &err);
                        return Err(err);
                    }
                }
            },
            Err(err) => {
                fail_all(&outstanding, &err);
                Err(err)
            }
        }
    }

    /// Fail queued input with `reason` for the duration of the retry
    /// backoff. Returns `false` once the queue is closed for good.
    async fn drain_for(&self, delay: Duration, reason: &ProxyError) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                popped = self.inner.input.pop_front() => match popped {
                    Some(request) => request.finish_with_error(reason.clone()),
                    None => return false,
                },
            }
        }
    }
}

fn fail_all(outstanding: &Mutex<VecDeque<Request>>, err: &ProxyError) {
    loop {
        let Some(request) = outstanding.lock().pop_front() else {
            return;
        };
        request.finish_with_error(err.clone());
    }
}

async fn run(conn: BackendConn) {
    let inner = conn.inner.clone();
    let mut round: u32 = 0;
    loop {
        inner.set_state(ConnState::Connecting);
        let failure = match conn.open_stream().await {
            Ok(stream) => {
                debug!(cluster = %inner.cluster, backend = %inner.addr, "backend connected");
                round = 0;
                inner.set_state(ConnState::Ready);
                match conn.serve(stream).await {
                    Ok(()) => {
                        info!(cluster = %inner.cluster, backend = %inner.addr, "backend connection retired");
                        inner.set_state(ConnState::Closed);
                        return;
                    }
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        warn!(
            cluster = %inner.cluster,
            backend = %inner.addr,
            error = %failure,
            "backend connection failed"
        );
        metrics::backend_error_incr(&inner.cluster, &inner.addr);
        inner.set_state(ConnState::Draining);
        if !conn.drain_for(retry_backoff(round), &failure).await {
            inner.set_state(ConnState::Closed);
            return;
        }
        round = round.saturating_add(1);
    }
}
