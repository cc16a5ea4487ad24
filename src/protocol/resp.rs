use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::com::ProxyError;

const CRLF: &[u8] = b"\r\n";

/// One RESP2 frame.
///
/// Requests are arrays of bulk strings; replies may be any variant. The
/// proxy relays frames without interpreting them beyond routing, so the
/// null bulk and null array keep their own variants instead of collapsing
/// into an option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Resp>),
    NullArray,
}

impl Resp {
    pub fn bulk(data: impl Into<Bytes>) -> Resp {
        Resp::Bulk(data.into())
    }

    pub fn simple(data: &'static str) -> Resp {
        Resp::Simple(Bytes::from_static(data.as_bytes()))
    }

    pub fn error_text(message: String) -> Resp {
        Resp::Error(Bytes::from(message))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Resp::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Resp::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Payload of a textual frame (simple string, error, or bulk).
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Resp::Simple(data) | Resp::Error(data) | Resp::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Human-readable frame kind, used in protocol error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Resp::Simple(_) => "simple string",
            Resp::Error(_) => "error",
            Resp::Integer(_) => "integer",
            Resp::Bulk(_) => "bulk string",
            Resp::Null => "null bulk",
            Resp::Array(_) => "array",
            Resp::NullArray => "null array",
        }
    }
}

/// RESP2 frame codec for both the client side and the backend side.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Resp;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Resp>, ProxyError> {
        let (frame, used) = {
            let mut parser = Parser::new(&src[..]);
            let frame = parser.frame()?;
            (frame, parser.pos)
        };
        match frame {
            Some(frame) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Resp> for RespCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Resp, dst: &mut BytesMut) -> Result<(), ProxyError> {
        write_frame(&item, dst);
        Ok(())
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Parse one frame; `None` means the buffer holds an incomplete frame
    /// and the caller should read more bytes.
    fn frame(&mut self) -> Result<Option<Resp>, ProxyError> {
        let Some(&prefix) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        match prefix {
            b'+' => Ok(self.line()?.map(|line| Resp::Simple(copy(line)))),
            b'-' => Ok(self.line()?.map(|line| Resp::Error(copy(line)))),
            b':' => match self.line()? {
                None => Ok(None),
                Some(line) => {
                    let value = btoi::btoi::<i64>(line)
                        .map_err(|_| ProxyError::Protocol("malformed integer".into()))?;
                    Ok(Some(Resp::Integer(value)))
                }
            },
            b'$' => self.bulk(),
            b'*' => self.array(),
            other => Err(ProxyError::Protocol(format!(
                "unknown frame prefix {:#04x}",
                other
            ))),
        }
    }

    fn bulk(&mut self) -> Result<Option<Resp>, ProxyError> {
        let len = match self.length("bulk string")? {
            None => return Ok(None),
            Some(len) if len < 0 => return Ok(Some(Resp::Null)),
            Some(len) => len as usize,
        };
        if self.buf.len() < self.pos + len + CRLF.len() {
            return Ok(None);
        }
        let data = copy(&self.buf[self.pos..self.pos + len]);
        if &self.buf[self.pos + len..self.pos + len + CRLF.len()] != CRLF {
            return Err(ProxyError::Protocol("bulk string missing CRLF".into()));
        }
        self.pos += len + CRLF.len();
        Ok(Some(Resp::Bulk(data)))
    }

    fn array(&mut self) -> Result<Option<Resp>, ProxyError> {
        let len = match self.length("array")? {
            None => return Ok(None),
            Some(len) if len < 0 => return Ok(Some(Resp::NullArray)),
            Some(len) => len as usize,
        };
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match self.frame()? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(Resp::Array(items)))
    }

    fn length(&mut self, kind: &str) -> Result<Option<i64>, ProxyError> {
        match self.line()? {
            None => Ok(None),
            Some(line) => btoi::btoi::<i64>(line)
                .map(Some)
                .map_err(|_| ProxyError::Protocol(format!("malformed {} length", kind))),
        }
    }

    fn line(&mut self) -> Result<Option<&'a [u8]>, ProxyError> {
        let rest = &self.buf[self.pos..];
        match rest.windows(CRLF.len()).position(|w| w == CRLF) {
            Some(at) => {
                self.pos += at + CRLF.len();
                Ok(Some(&rest[..at]))
            }
            None => Ok(None),
        }
    }
}

fn copy(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}

fn write_frame(frame: &Resp, dst: &mut BytesMut) {
    match frame {
        Resp::Simple(data) => write_line(b'+', data, dst),
        Resp::Error(data) => write_line(b'-', data, dst),
        Resp::Integer(value) => write_line(b':', value.to_string().as_bytes(), dst),
        Resp::Bulk(data) => {
            write_line(b'$', data.len().to_string().as_bytes(), dst);
            dst.extend_from_slice(data);
            dst.extend_from_slice(CRLF);
        }
        Resp::Null => dst.extend_from_slice(b"$-1\r\n"),
        Resp::Array(items) => {
            write_line(b'*', items.len().to_string().as_bytes(), dst);
            for item in items {
                write_frame(item, dst);
            }
        }
        Resp::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> Option<Resp> {
        let mut buf = BytesMut::from(input);
        RespCodec.decode(&mut buf).expect("decode should not fail")
    }

    #[test]
    fn decodes_every_reply_shape() {
        assert_eq!(decode_one(b"+OK\r\n"), Some(Resp::simple("OK")));
        assert_eq!(
            decode_one(b"-ERR busy\r\n"),
            Some(Resp::Error(Bytes::from_static(b"ERR busy")))
        );
        assert_eq!(decode_one(b":42\r\n"), Some(Resp::Integer(42)));
        assert_eq!(decode_one(b"$5\r\nhello\r\n"), Some(Resp::bulk("hello")));
        assert_eq!(decode_one(b"$-1\r\n"), Some(Resp::Null));
        assert_eq!(decode_one(b"*-1\r\n"), Some(Resp::NullArray));
        assert_eq!(
            decode_one(b"*2\r\n:0\r\n$-1\r\n"),
            Some(Resp::Array(vec![Resp::Integer(0), Resp::Null]))
        );
    }

    #[test]
    fn partial_frames_ask_for_more_data() {
        assert_eq!(decode_one(b""), None);
        assert_eq!(decode_one(b"$5\r\nhel"), None);
        assert_eq!(decode_one(b"*2\r\n$3\r\nGET\r\n"), None);
        assert_eq!(decode_one(b":12"), None);
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut buf = BytesMut::from(&b"+OK\r\n:7\r\n"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), Some(Resp::simple("OK")));
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), Some(Resp::Integer(7)));
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_garbage_prefix() {
        let mut buf = BytesMut::from(&b"?huh\r\n"[..]);
        assert!(RespCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_request_array() {
        let mut buf = BytesMut::new();
        let frame = Resp::Array(vec![Resp::bulk("GET"), Resp::bulk("k")]);
        RespCodec.encode(frame, &mut buf).unwrap();
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }

    #[test]
    fn encodes_null_variants() {
        let mut buf = BytesMut::new();
        RespCodec.encode(Resp::Null, &mut buf).unwrap();
        RespCodec.encode(Resp::NullArray, &mut buf).unwrap();
        assert_eq!(&buf[..], b"$-1\r\n*-1\r\n");
    }
}
