//! Keyed cache of outbound packet connections.
//!
//! Entries are keyed by `(destination, timeout)`: distinct timeouts for the
//! same destination are distinct connections. There is no return operation
//! and no eviction; per-connection locking makes a borrowed connection safe
//! to use without giving it back, and a dead entry is replaced lazily on the
//! next borrow. Growth is bounded by the number of distinct
//! destination/timeout pairs ever seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::conn::TlsConn;
use crate::error::TransportResult;
use crate::tls::TlsContext;

type PoolKey = (String, Duration);

/// Pool of outbound connections, shared by all `write_to` callers.
pub struct ConnectionPool {
    conns: Mutex<HashMap<PoolKey, Arc<TlsConn>>>,
    tls: TlsContext,
    keepalive: Option<Duration>,
}

impl ConnectionPool {
    pub fn new(tls: TlsContext, config: &TransportConfig) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            tls,
            keepalive: config.keepalive_interval(),
        }
    }

    /// Return a live connection for `(addr, timeout)`, dialing a new one if
    /// the entry is absent or dead. The connection does not need to be
    /// returned: per-connection locking makes shared use safe.
    ///
    /// Concurrent borrows for the same key may race to dial; the map keeps
    /// the last writer's connection. Either connection is safe to use, so
    /// the race costs at most one duplicate dial.
    ///
    /// # Errors
    ///
    /// Returns the dial error if a replacement connection cannot be
    /// established.
    pub async fn borrow(&self, addr: &str, timeout: Duration) -> TransportResult<Arc<TlsConn>> {
        let key = (addr.to_string(), timeout);

        if let Some(conn) = self.conns.lock().get(&key) {
            if conn.is_live() {
                return Ok(Arc::clone(conn));
            }
        }

        let conn = Arc::new(TlsConn::dial(addr, timeout, &self.tls, self.keepalive).await?);
        self.conns.lock().insert(key, Arc::clone(&conn));
        Ok(conn)
    }

    /// Number of cached entries, live or dead.
    pub fn size(&self) -> usize {
        self.conns.lock().len()
    }
}
