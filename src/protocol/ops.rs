use bitflags::bitflags;
use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::com::ProxyError;
use crate::protocol::resp::Resp;

bitflags! {
    /// Dispatch attributes of an opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlag: u8 {
        /// The command mutates the keyspace.
        const WRITE        = 0b0000_0001;
        /// The command may mutate depending on arguments (scripts).
        const MAY_WRITE    = 0b0000_0010;
        /// The command must run on the primary even though it only reads.
        const MASTER_ONLY  = 0b0000_0100;
        /// The proxy refuses to relay the command.
        const NOT_ALLOWED  = 0b0000_1000;
        /// Answered by the session itself, never reaches a backend.
        const LOCAL        = 0b0001_0000;
        /// Multi-key command split into per-key subrequests.
        const SUB_DISPATCH = 0b0010_0000;
    }
}

impl OpFlag {
    /// Read-only commands are eligible for replica dispatch.
    pub fn is_read_only(self) -> bool {
        !self.intersects(OpFlag::WRITE | OpFlag::MAY_WRITE | OpFlag::MASTER_ONLY)
    }
}

const READ: OpFlag = OpFlag::empty();
const WRITE: OpFlag = OpFlag::WRITE;
const MAY_WRITE: OpFlag = OpFlag::MAY_WRITE;
const NOT_ALLOWED: OpFlag = OpFlag::NOT_ALLOWED;
const LOCAL: OpFlag = OpFlag::LOCAL;
const SUB: OpFlag = OpFlag::SUB_DISPATCH;
const READ_MASTER: OpFlag = OpFlag::MASTER_ONLY;

#[rustfmt::skip]
const OP_ENTRIES: &[(&[u8], OpFlag)] = &[
    // connection / control
    (b"PING",             LOCAL),
    (b"ECHO",             LOCAL),
    (b"SELECT",           LOCAL),
    (b"QUIT",             LOCAL),
    (b"AUTH",             LOCAL),
    (b"COMMAND",          LOCAL),
    (b"INFO",             NOT_ALLOWED),
    (b"CONFIG",           NOT_ALLOWED),
    (b"SHUTDOWN",         NOT_ALLOWED),
    (b"SLAVEOF",          NOT_ALLOWED),
    (b"REPLICAOF",        NOT_ALLOWED),
    (b"MULTI",            NOT_ALLOWED),
    (b"EXEC",             NOT_ALLOWED),
    (b"DISCARD",          NOT_ALLOWED),
    (b"WATCH",            NOT_ALLOWED),
    (b"UNWATCH",          NOT_ALLOWED),
    (b"SUBSCRIBE",        NOT_ALLOWED),
    (b"UNSUBSCRIBE",      NOT_ALLOWED),
    (b"PSUBSCRIBE",       NOT_ALLOWED),
    (b"PUNSUBSCRIBE",     NOT_ALLOWED),
    (b"PUBLISH",          NOT_ALLOWED),

    // generic keyspace
    (b"DEL",              SUB.union(OpFlag::WRITE)),
    (b"UNLINK",           SUB.union(OpFlag::WRITE)),
    (b"EXISTS",           SUB),
    (b"DUMP",             READ),
    (b"RESTORE",          WRITE),
    (b"EXPIRE",           WRITE),
    (b"EXPIREAT",         WRITE),
    (b"PEXPIRE",          WRITE),
    (b"PEXPIREAT",        WRITE),
    (b"PERSIST",          WRITE),
    (b"TTL",              READ),
    (b"PTTL",             READ),
    (b"TYPE",             READ),
    (b"SORT",             WRITE),
    (b"KEYS",             NOT_ALLOWED),
    (b"SCAN",             NOT_ALLOWED),
    (b"RANDOMKEY",        NOT_ALLOWED),
    (b"RENAME",           NOT_ALLOWED),
    (b"RENAMENX",         NOT_ALLOWED),
    (b"MOVE",             NOT_ALLOWED),
    (b"MIGRATE",          NOT_ALLOWED),
    (b"OBJECT",           NOT_ALLOWED),
    (b"WAIT",             NOT_ALLOWED),

    // strings
    (b"GET",              READ),
    (b"SET",              WRITE),
    (b"SETNX",            WRITE),
    (b"SETEX",            WRITE),
    (b"PSETEX",           WRITE),
    (b"GETSET",           WRITE),
    (b"GETRANGE",         READ),
    (b"SETRANGE",         WRITE),
    (b"APPEND",           WRITE),
    (b"STRLEN",           READ),
    (b"SUBSTR",           READ),
    (b"INCR",             WRITE),
    (b"INCRBY",           WRITE),
    (b"INCRBYFLOAT",      WRITE),
    (b"DECR",             WRITE),
    (b"DECRBY",           WRITE),
    (b"GETBIT",           READ),
    (b"SETBIT",           WRITE),
    (b"BITCOUNT",         READ),
    (b"BITPOS",           READ),
    (b"BITFIELD",         WRITE),
    (b"BITOP",            NOT_ALLOWED),
    (b"MGET",             SUB),
    (b"MSET",             SUB.union(OpFlag::WRITE)),
    (b"MSETNX",           NOT_ALLOWED),

    // hashes
    (b"HDEL",             WRITE),
    (b"HEXISTS",          READ),
    (b"HGET",             READ),
    (b"HGETALL",          READ),
    (b"HINCRBY",          WRITE),
    (b"HINCRBYFLOAT",     WRITE),
    (b"HKEYS",            READ),
    (b"HLEN",             READ),
    (b"HMGET",            READ),
    (b"HMSET",            WRITE),
    (b"HSET",             WRITE),
    (b"HSETNX",           WRITE),
    (b"HSTRLEN",          READ),
    (b"HVALS",            READ),
    (b"HSCAN",            READ),

    // lists
    (b"LINDEX",           READ),
    (b"LINSERT",          WRITE),
    (b"LLEN",             READ),
    (b"LPOP",             WRITE),
    (b"LPUSH",            WRITE),
    (b"LPUSHX",           WRITE),
    (b"LRANGE",           READ),
    (b"LREM",             WRITE),
    (b"LSET",             WRITE),
    (b"LTRIM",            WRITE),
    (b"RPOP",             WRITE),
    (b"RPOPLPUSH",        WRITE),
    (b"RPUSH",            WRITE),
    (b"RPUSHX",           WRITE),
    (b"BLPOP",            NOT_ALLOWED),
    (b"BRPOP",            NOT_ALLOWED),
    (b"BRPOPLPUSH",       NOT_ALLOWED),

    // sets
    (b"SADD",             WRITE),
    (b"SCARD",            READ),
    (b"SDIFF",            READ),
    (b"SDIFFSTORE",       WRITE),
    (b"SINTER",           READ),
    (b"SINTERSTORE",      WRITE),
    (b"SISMEMBER",        READ),
    (b"SMEMBERS",         READ),
    (b"SMOVE",            WRITE),
    (b"SPOP",             WRITE),
    (b"SRANDMEMBER",      READ),
    (b"SREM",             WRITE),
    (b"SUNION",           READ),
    (b"SUNIONSTORE",      WRITE),
    (b"SSCAN",            READ),

    // sorted sets
    (b"ZADD",             WRITE),
    (b"ZCARD",            READ),
    (b"ZCOUNT",           READ),
    (b"ZINCRBY",          WRITE),
    (b"ZINTERSTORE",      WRITE),
    (b"ZUNIONSTORE",      WRITE),
    (b"ZLEXCOUNT",        READ),
    (b"ZRANGE",           READ),
    (b"ZRANGEBYLEX",      READ),
    (b"ZRANGEBYSCORE",    READ),
    (b"ZRANK",            READ),
    (b"ZREM",             WRITE),
    (b"ZREMRANGEBYLEX",   WRITE),
    (b"ZREMRANGEBYRANK",  WRITE),
    (b"ZREMRANGEBYSCORE", WRITE),
    (b"ZREVRANGE",        READ),
    (b"ZREVRANGEBYLEX",   READ),
    (b"ZREVRANGEBYSCORE", READ),
    (b"ZREVRANK",         READ),
    (b"ZSCORE",           READ),
    (b"ZSCAN",            READ),

    // hyperloglog
    (b"PFADD",            WRITE),
    (b"PFCOUNT",          READ),
    (b"PFMERGE",          WRITE),

    // geo
    (b"GEOADD",           WRITE),
    (b"GEODIST",          READ),
    (b"GEOPOS",           READ),
    (b"GEOHASH",          READ),

    // scripting
    (b"EVAL",             MAY_WRITE),
    (b"EVALSHA",          MAY_WRITE),
    (b"SCRIPT",           NOT_ALLOWED),

    // slot inspection on slot-aware backends
    (b"SLOTSINFO",        READ_MASTER),
    (b"SLOTSSCAN",        READ_MASTER),
    (b"SLOTSMGRTONE",     NOT_ALLOWED),
    (b"SLOTSMGRTTAGONE",  NOT_ALLOWED),
    (b"SLOTSMGRTSLOT",    NOT_ALLOWED),
    (b"SLOTSMGRTTAGSLOT", NOT_ALLOWED),
];

static OP_TABLE: Lazy<HashMap<&'static [u8], OpFlag>> =
    Lazy::new(|| OP_ENTRIES.iter().copied().collect());

/// Resolve the opcode and its flags from a decoded command.
///
/// The returned name is uppercased; unknown commands are rejected rather
/// than relayed, matching the behaviour clients see from a cluster node
/// fronting an unknown opcode.
pub fn parse_op(multi: &[Resp]) -> Result<(Bytes, OpFlag), ProxyError> {
    let first = multi
        .first()
        .ok_or_else(|| ProxyError::BadRequest("empty command".into()))?;
    let name = first
        .as_bytes()
        .ok_or_else(|| ProxyError::BadRequest("command name must be a string".into()))?;
    let mut upper = name.to_vec();
    upper.make_ascii_uppercase();
    match OP_TABLE.get(upper.as_slice()) {
        Some(&flags) => Ok((Bytes::from(upper), flags)),
        None => Err(ProxyError::BadRequest(format!(
            "unknown command '{}'",
            String::from_utf8_lossy(name)
        ))),
    }
}

/// Position of the routed key for an opcode.
fn key_position(op: &[u8]) -> usize {
    match op {
        b"EVAL" | b"EVALSHA" => 3,
        _ => 1,
    }
}

/// The key a command routes on, empty when the command carries none.
pub fn hash_key(multi: &[Resp], op: &[u8]) -> Bytes {
    multi
        .get(key_position(op))
        .and_then(Resp::as_bytes)
        .cloned()
        .unwrap_or_else(Bytes::new)
}
