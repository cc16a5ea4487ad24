use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::com::ProxyError;
use crate::metrics::{self, FrontConnectionGuard};
use crate::protocol::ops::{self, OpFlag};
use crate::protocol::resp::{Resp, RespCodec};
use crate::proxy::forward::ForwardMethod;
use crate::proxy::queue::RequestQueue;
use crate::proxy::request::{CoalesceFn, Request};
use crate::proxy::router::Router;

/// One client connection.
///
/// The decode half turns frames into requests, forwards them, and pushes
/// them onto a session-local queue; the encode half pops that queue in
/// order, awaits each batch, and ships the reply. Pipeline ordering is
/// therefore preserved even when requests fan out across backends.
pub struct FrontendSession {
    cluster: Arc<str>,
    router: Arc<Router>,
    forward: Arc<dyn ForwardMethod>,
    databases: u32,
    database: u32,
    broken: Arc<AtomicBool>,
}

enum Disposition {
    Continue,
    Quit,
}

impl FrontendSession {
    pub fn new(
        cluster: Arc<str>,
        router: Arc<Router>,
        forward: Arc<dyn ForwardMethod>,
        databases: u32,
    ) -> FrontendSession {
        FrontendSession {
            cluster,
            router,
            forward,
            databases,
            database: 0,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drive the connection to completion. The shared broken flag is set
    /// on the way out so abandoned requests stop retrying.
    pub async fn handle(self, stream: TcpStream) -> Result<(), ProxyError> {
        let broken = self.broken.clone();
        let result = self.run(stream).await;
        broken.store(true, Ordering::Release);
        result
    }

    async fn run(mut self, stream: TcpStream) -> Result<(), ProxyError> {
        stream.set_nodelay(true)?;
        let _guard = FrontConnectionGuard::new(&self.cluster);
        let cluster = self.cluster.clone();
        let (mut sink, mut frames) = Framed::new(stream, RespCodec).split();
        let tasks = RequestQueue::new();

        let decode_half = async {
            loop {
                let frame = match frames.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        tasks.close();
                        return Err(err);
                    }
                    None => {
                        tasks.close();
                        return Ok(());
                    }
                };
                match self.dispatch(frame, &tasks).await {
                    Disposition::Continue => {}
                    Disposition::Quit => {
                        tasks.close();
                        return Ok(());
                    }
                }
            }
        };

        let encode_half = async {
            while let Some(request) = tasks.pop_front().await {
                request.wait().await;
                let frame = reply_frame(&request);
                metrics::observe_total(&cluster, elapsed_micros(&request));
                sink.send(frame).await?;
            }
            sink.close().await?;
            Ok(())
        };

        tokio::try_join!(decode_half, encode_half)?;
        Ok(())
    }

    async fn dispatch(&mut self, frame: Resp, tasks: &RequestQueue) -> Disposition {
        let multi = match frame {
            Resp::Array(items) if !items.is_empty() => items,
            other => {
                debug!(cluster = %self.cluster, kind = other.kind_name(), "unroutable frame");
                self.push_failed(
                    tasks,
                    ProxyError::BadRequest("expected a command array".into()),
                );
                return Disposition::Continue;
            }
        };

        let (op, flags) = match ops::parse_op(&multi) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.push_failed(tasks, err);
                return Disposition::Continue;
            }
        };

        if flags.contains(OpFlag::NOT_ALLOWED) {
            self.push_failed(
                tasks,
                ProxyError::BadRequest(format!(
                    "command '{}' is not allowed",
                    String::from_utf8_lossy(&op)
                )),
            );
            return Disposition::Continue;
        }

        if flags.contains(OpFlag::LOCAL) {
            return self.dispatch_local(multi, op, flags, tasks);
        }

        let request = Request::new(multi, op, flags, self.database, self.broken.clone());
        if flags.contains(OpFlag::SUB_DISPATCH) && wants_fanout(&request) {
            self.dispatch_subs(request, tasks).await;
        } else {
            let hkey = ops::hash_key(request.multi(), request.op_str());
            self.forward_one(&request, &hkey).await;
            tasks.push_back(request);
        }
        Disposition::Continue
    }

    /// Forward one request, recording a local error on failure so the
    /// encode half can answer in order.
    async fn forward_one(&self, request: &Request, hkey: &[u8]) {
        let slot = self.router.slot_for_key(hkey);
        if let Err(err) = self.forward.forward(&slot, request.clone(), hkey).await {
            metrics::global_error_incr();
            request.set_error(err);
        }
    }

    async fn dispatch_subs(&self, parent: Request, tasks: &RequestQueue) {
        let head = parent.multi()[0].clone();
        match parent.op_str().as_ref() {
            b"MSET" => {
                if parent.multi().len() % 2 != 1 {
                    parent.set_error(ProxyError::BadRequest(
                        "wrong number of arguments for 'MSET'".into(),
                    ));
                    tasks.push_back(parent);
                    return;
                }
                let parts = parent.multi()[1..]
                    .chunks(2)
                    .map(|pair| vec![head.clone(), pair[0].clone(), pair[1].clone()])
                    .collect();
                let subs = parent.make_subs(parts);
                self.forward_subs(&subs).await;
                parent.set_coalesce(coalesce_mset(subs));
            }
            b"MGET" => {
                let parts = parent.multi()[1..]
                    .iter()
                    .map(|key| vec![head.clone(), key.clone()])
                    .collect();
                let subs = parent.make_subs(parts);
                self.forward_subs(&subs).await;
                parent.set_coalesce(coalesce_mget(subs));
            }
            // DEL / UNLINK / EXISTS reply with a count across keys
            _ => {
                let parts = parent.multi()[1..]
                    .iter()
                    .map(|key| vec![head.clone(), key.clone()])
                    .collect();
                let subs = parent.make_subs(parts);
                self.forward_subs(&subs).await;
                parent.set_coalesce(coalesce_count(subs));
            }
        }
        tasks.push_back(parent);
    }

    async fn forward_subs(&self, subs: &[Request]) {
        for sub in subs {
            let hkey = ops::hash_key(sub.multi(), sub.op_str());
            self.forward_one(sub, &hkey).await;
        }
    }

    fn dispatch_local(
        &mut self,
        multi: Vec<Resp>,
        op: Bytes,
        flags: OpFlag,
        tasks: &RequestQueue,
    ) -> Disposition {
        let request = Request::new(multi, op, flags, self.database, self.broken.clone());
        let mut disposition = Disposition::Continue;
        match request.op_str().as_ref() {
            b"PING" => match request.multi() {
                [_] => request.set_reply(Resp::simple("PONG")),
                [_, message] => request.set_reply(message.clone()),
                _ => request.set_error(ProxyError::BadRequest(
                    "wrong number of arguments for 'PING'".into(),
                )),
            },
            b"ECHO" => match request.multi() {
                [_, message] => request.set_reply(message.clone()),
                _ => request.set_error(ProxyError::BadRequest(
                    "wrong number of arguments for 'ECHO'".into(),
                )),
            },
            b"SELECT" => match self.parse_database(request.multi()) {
                Some(database) => {
                    self.database = database;
                    request.set_reply(Resp::simple("OK"));
                }
                None => request.set_reply(Resp::Error(Bytes::from_static(
                    b"ERR invalid DB index",
                ))),
            },
            b"AUTH" => request.set_reply(Resp::Error(Bytes::from_static(
                b"ERR Client sent AUTH, but no password is set",
            ))),
            b"COMMAND" => request.set_reply(Resp::NullArray),
            // QUIT
            _ => {
                request.set_reply(Resp::simple("OK"));
                disposition = Disposition::Quit;
            }
        }
        tasks.push_back(request);
        disposition
    }

    fn parse_database(&self, multi: &[Resp]) -> Option<u32> {
        let [_, index] = multi else {
            return None;
        };
        let index = btoi::btoi::<u32>(index.as_bytes()?).ok()?;
        (index < self.databases).then_some(index)
    }

    fn push_failed(&self, tasks: &RequestQueue, err: ProxyError) {
        metrics::global_error_incr();
        let request = Request::internal(Vec::new(), self.database);
        request.set_error(err);
        tasks.push_back(request);
    }
}

/// Multi-key commands only fan out when they reference several keys; a
/// single-key form takes the plain path.
fn wants_fanout(request: &Request) -> bool {
    match request.op_str().as_ref() {
        b"MSET" => request.multi().len() > 3,
        _ => request.multi().len() > 2,
    }
}

fn coalesce_mget(subs: Vec<Request>) -> CoalesceFn {
    Box::new(move |parent| {
        let mut items = Vec::with_capacity(subs.len());
        for sub in &subs {
            if let Some(err) = sub.take_error() {
                return Err(err);
            }
            match sub.take_reply() {
                Some(Resp::Array(sub_items)) => {
                    let [item]: [Resp; 1] = sub_items.try_into().map_err(|got: Vec<Resp>| {
                        ProxyError::BadReply(format!("MGET subreply of {} elements", got.len()))
                    })?;
                    items.push(item);
                }
                Some(Resp::Error(text)) => {
                    return Err(ProxyError::BadReply(
                        String::from_utf8_lossy(&text).into_owned(),
                    ))
                }
                Some(other) => {
                    return Err(ProxyError::BadReply(format!(
                        "MGET subreply should be array, got {}",
                        other.kind_name()
                    )))
                }
                None => return Err(ProxyError::RespIsRequired),
            }
        }
        parent.set_reply(Resp::Array(items));
        Ok(())
    })
}

fn coalesce_mset(subs: Vec<Request>) -> CoalesceFn {
    Box::new(move |parent| {
        let mut last = None;
        for sub in &subs {
            if let Some(err) = sub.take_error() {
                return Err(err);
            }
            let reply = sub.take_reply().ok_or(ProxyError::RespIsRequired)?;
            if reply.is_error() {
                parent.set_reply(reply);
                return Ok(());
            }
            last = Some(reply);
        }
        parent.set_reply(last.unwrap_or_else(|| Resp::simple("OK")));
        Ok(())
    })
}

fn coalesce_count(subs: Vec<Request>) -> CoalesceFn {
    Box::new(move |parent| {
        let mut total = 0i64;
        for sub in &subs {
            if let Some(err) = sub.take_error() {
                return Err(err);
            }
            match sub.take_reply() {
                Some(Resp::Integer(n)) => total += n,
                Some(reply @ Resp::Error(_)) => {
                    parent.set_reply(reply);
                    return Ok(());
                }
                Some(other) => {
                    return Err(ProxyError::BadReply(format!(
                        "count subreply should be integer, got {}",
                        other.kind_name()
                    )))
                }
                None => return Err(ProxyError::RespIsRequired),
            }
        }
        parent.set_reply(Resp::Integer(total));
        Ok(())
    })
}

fn reply_frame(request: &Request) -> Resp {
    if let Err(err) = request.coalesce() {
        metrics::global_error_incr();
        return error_frame(&err);
    }
    if let Some(err) = request.take_error() {
        metrics::global_error_incr();
        return error_frame(&err);
    }
    match request.take_reply() {
        Some(frame) => frame,
        None => {
            metrics::global_error_incr();
            error_frame(&ProxyError::RespIsRequired)
        }
    }
}

fn error_frame(err: &ProxyError) -> Resp {
    match err {
        ProxyError::SlotNotReady => Resp::Error(Bytes::from_static(
            b"LOADING slot is not ready, may be offline",
        )),
        ProxyError::BadRequest(detail) => Resp::error_text(format!("ERR {detail}")),
        other => Resp::error_text(format!("ERR handle request, {other}")),
    }
}

fn elapsed_micros(request: &Request) -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    ((now - request.unix_nano()).max(0) as f64) / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabricated(parts: &[&str]) -> Request {
        let multi: Vec<Resp> = parts.iter().map(|p| Resp::bulk(p.to_string())).collect();
        let (op, flags) = ops::parse_op(&multi).unwrap();
        Request::new(multi, op, flags, 0, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn mget_coalesce_unwraps_single_element_arrays() {
        let parent = fabricated(&["MGET", "a", "b"]);
        let subs = parent.make_subs(vec![
            vec![Resp::bulk("MGET"), Resp::bulk("a")],
            vec![Resp::bulk("MGET"), Resp::bulk("b")],
        ]);
        subs[0].set_reply(Resp::Array(vec![Resp::bulk("one")]));
        subs[1].set_reply(Resp::Array(vec![Resp::Null]));
        parent.set_coalesce(coalesce_mget(subs));

        parent.coalesce().unwrap();
        assert_eq!(
            parent.take_reply(),
            Some(Resp::Array(vec![Resp::bulk("one"), Resp::Null]))
        );
    }

    #[test]
    fn mget_coalesce_propagates_sub_errors() {
        let parent = fabricated(&["MGET", "a", "b"]);
        let subs = parent.make_subs(vec![
            vec![Resp::bulk("MGET"), Resp::bulk("a")],
            vec![Resp::bulk("MGET"), Resp::bulk("b")],
        ]);
        subs[0].set_reply(Resp::Array(vec![Resp::bulk("one")]));
        subs[1].set_error(ProxyError::SlotNotReady);
        parent.set_coalesce(coalesce_mget(subs));

        assert!(matches!(
            parent.coalesce(),
            Err(ProxyError::SlotNotReady)
        ));
    }

    #[test]
    fn count_coalesce_sums_integers() {
        let parent = fabricated(&["DEL", "a", "b", "c"]);
        let subs = parent.make_subs(vec![
            vec![Resp::bulk("DEL"), Resp::bulk("a")],
            vec![Resp::bulk("DEL"), Resp::bulk("b")],
            vec![Resp::bulk("DEL"), Resp::bulk("c")],
        ]);
        for (sub, n) in subs.iter().zip([1, 0, 1]) {
            sub.set_reply(Resp::Integer(n));
        }
        parent.set_coalesce(coalesce_count(subs));

        parent.coalesce().unwrap();
        assert_eq!(parent.take_reply(), Some(Resp::Integer(2)));
    }

    #[test]
    fn mset_coalesce_keeps_first_error_reply() {
        let parent = fabricated(&["MSET", "a", "1", "b", "2"]);
        let subs = parent.make_subs(vec![
            vec![Resp::bulk("MSET"), Resp::bulk("a"), Resp::bulk("1")],
            vec![Resp::bulk("MSET"), Resp::bulk("b"), Resp::bulk("2")],
        ]);
        subs[0].set_reply(Resp::Error(Bytes::from_static(b"ERR readonly")));
        subs[1].set_reply(Resp::simple("OK"));
        parent.set_coalesce(coalesce_mset(subs));

        parent.coalesce().unwrap();
        assert_eq!(
            parent.take_reply(),
            Some(Resp::Error(Bytes::from_static(b"ERR readonly")))
        );
    }

    #[test]
    fn fanout_threshold_spares_single_key_forms() {
        assert!(!wants_fanout(&fabricated(&["MGET", "only"])));
        assert!(wants_fanout(&fabricated(&["MGET", "a", "b"])));
        assert!(!wants_fanout(&fabricated(&["MSET", "k", "v"])));
        assert!(wants_fanout(&fabricated(&["MSET", "k", "v", "j", "w"])));
    }

    #[test]
    fn loading_errors_have_their_own_shape() {
        let frame = error_frame(&ProxyError::SlotNotReady);
        assert_eq!(
            frame,
            Resp::Error(Bytes::from_static(
                b"LOADING slot is not ready, may be offline"
            ))
        );
    }
}
