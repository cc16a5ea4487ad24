pub mod ops;
pub mod resp;

pub use ops::{hash_key, parse_op, OpFlag};
pub use resp::{Resp, RespCodec};
