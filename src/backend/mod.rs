pub mod conn;
pub mod pool;

pub use conn::{BackendConn, ConnOptions, ConnState};
pub use pool::{BackendPool, PoolOptions};
