use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the forwarding core.
///
/// The enum is `Clone` because a single backend failure finishes every
/// request that was outstanding or queued on that connection; I/O errors
/// are wrapped in an `Arc` to keep the clone cheap.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("slot is not ready, may be offline")]
    SlotNotReady,

    #[error("request is broken")]
    RequestBroken,

    #[error("resp is required")]
    RespIsRequired,

    #[error("bad migrate resp: {0}")]
    BadMigrateResp(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("bad reply from backend: {0}")]
    BadReply(String),

    #[error("invalid resp frame: {0}")]
    Protocol(String),

    #[error("backend read a reply with no request outstanding")]
    UnexpectedReply,

    #[error("backend io: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl ProxyError {
    /// True when the error came straight from the transport.
    pub fn is_io(&self) -> bool {
        matches!(self, ProxyError::Io(_))
    }
}
