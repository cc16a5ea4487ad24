use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::backend::conn::{BackendConn, ConnOptions};
use crate::com::ProxyError;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Logical databases served per backend (`SELECT` range).
    pub databases: u32,
    /// Parallel physical connections per (backend, database).
    pub parallel: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            databases: 16,
            parallel: 2,
            connect_timeout: Duration::from_millis(1_000),
        }
    }
}

/// The connection set for one backend address.
///
/// Connections are grouped by logical database so pipelined traffic never
/// needs an inline `SELECT`; within a database the request seed picks one
/// of the parallel connections deterministically.
pub struct BackendPool {
    addr: Arc<str>,
    host: Bytes,
    port: Bytes,
    conns: Vec<Vec<BackendConn>>,
}

impl BackendPool {
    pub fn connect(
        cluster: &Arc<str>,
        addr: &str,
        options: &PoolOptions,
    ) -> Result<BackendPool, ProxyError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("invalid backend address '{addr}'")))?;
        if host.is_empty() || port.is_empty() {
            return Err(ProxyError::BadRequest(format!(
                "invalid backend address '{addr}'"
            )));
        }

        let addr: Arc<str> = addr.into();
        let conn_options = ConnOptions {
            connect_timeout: options.connect_timeout,
        };
        let databases = options.databases.max(1) as usize;
        let parallel = options.parallel.max(1);

        let conns = (0..databases)
            .map(|_| {
                (0..parallel)
                    .map(|_| {
                        BackendConn::connect(cluster.clone(), addr.clone(), conn_options.clone())
                    })
                    .collect()
            })
            .collect();

        Ok(BackendPool {
            host: Bytes::copy_from_slice(host.as_bytes()),
            port: Bytes::copy_from_slice(port.as_bytes()),
            addr,
            conns,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Host portion, as a migrate command argument.
    pub fn host(&self) -> Bytes {
        self.host.clone()
    }

    /// Port portion, as a migrate command argument.
    pub fn port(&self) -> Bytes {
        self.port.clone()
    }

    /// Select a connection for `(database, seed)`.
    ///
    /// With `must` unset the call returns `None` unless the selected
    /// connection is live, which lets replica dispatch fall through to
    /// the next candidate; with `must` set the connection is returned in
    /// whatever state it is in and requests queue across reconnects.
    pub fn conn(&self, database: u32, seed: usize, must: bool) -> Option<BackendConn> {
        let per_db = self.conns.get(database as usize)?;
        let conn = &per_db[seed % per_db.len()];
        if !must && !conn.is_ready() {
            return None;
        }
        Some(conn.clone())
    }

    /// Close every connection in the pool.
    pub fn close(&self) {
        for per_db in &self.conns {
            for conn in per_db {
                conn.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_malformed_addresses() {
        let cluster: Arc<str> = "test".into();
        let options = PoolOptions::default();
        assert!(BackendPool::connect(&cluster, "no-port", &options).is_err());
        assert!(BackendPool::connect(&cluster, ":6379", &options).is_err());
        assert!(BackendPool::connect(&cluster, "host:", &options).is_err());
    }

    #[tokio::test]
    async fn splits_host_and_port() {
        let cluster: Arc<str> = "test".into();
        let options = PoolOptions {
            databases: 1,
            parallel: 1,
            ..Default::default()
        };
        let pool = BackendPool::connect(&cluster, "127.0.0.1:6379", &options).unwrap();
        assert_eq!(&pool.host()[..], b"127.0.0.1");
        assert_eq!(&pool.port()[..], b"6379");
        assert_eq!(pool.addr(), "127.0.0.1:6379");
        pool.close();
    }

    #[tokio::test]
    async fn seed_selects_deterministically() {
        let cluster: Arc<str> = "test".into();
        let options = PoolOptions {
            databases: 1,
            parallel: 3,
            ..Default::default()
        };
        let pool = BackendPool::connect(&cluster, "127.0.0.1:6379", &options).unwrap();
        let first = pool.conn(0, 7, true).unwrap();
        let second = pool.conn(0, 7, true).unwrap();
        assert!(first.same_as(&second));
        assert!(pool.conn(2, 0, true).is_none());
        pool.close();
    }
}
