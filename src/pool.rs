//! Bounded connection pool for broker transports
//!
//! One sub-pool per configured transport. A semaphore bounds the number of
//! live connections, an idle free list allows reuse, and a maintenance sweep
//! evicts connections that have sat idle too long. Connections released as
//! unhealthy are closed and replaced lazily on the next borrow, so a flapping
//! broker does not cause a reconnect storm.
//!
//! Checkout/checkin is by move: a `PooledConnection` can only be given back
//! once, which makes double release unrepresentable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::config::PoolConfig;
use crate::transport::{Connection, Transport, TransportError};

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Borrow failures, kept distinct from publish failures
#[derive(Debug)]
pub enum PoolError {
    /// No connection became free within the borrow timeout
    BorrowTimeout { transport: String },

    /// Dialing a replacement connection failed
    Connect {
        transport: String,
        source: TransportError,
    },

    /// The requested transport is not configured
    UnknownTransport(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::BorrowTimeout { transport } => {
                write!(f, "timed out waiting for a free '{}' connection", transport)
            }
            PoolError::Connect { transport, source } => {
                write!(f, "failed to open '{}' connection: {}", transport, source)
            }
            PoolError::UnknownTransport(name) => {
                write!(f, "no transport named '{}' is configured", name)
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A connection borrowed from the pool.
///
/// Holds the capacity permit for as long as the borrow lasts; give it back
/// via [`ConnectionPool::release`].
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    transport: String,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    last_used: Instant,
}

struct TransportPool {
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    borrowed: AtomicUsize,
    config: PoolConfig,
}

impl TransportPool {
    fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(Vec::new()),
            borrowed: AtomicUsize::new(0),
            config,
        }
    }

    async fn borrow(&self) -> PoolResult<PooledConnection> {
        let name = self.transport.name().to_string();

        let permit = tokio::time::timeout(
            self.config.borrow_timeout(),
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::BorrowTimeout {
            transport: name.clone(),
        })?
        .expect("pool semaphore closed");

        // reuse the most recently used idle connection if there is one
        let reused = self.idle.lock().await.pop();

        let conn = match reused {
            Some(idle) => {
                trace!("reusing idle '{name}' connection");
                idle.conn
            }
            None => {
                trace!("dialing new '{name}' connection");
                self.transport.connect().await.map_err(|source| {
                    // permit drops here, freeing the slot for the next borrow
                    PoolError::Connect {
                        transport: name.clone(),
                        source,
                    }
                })?
            }
        };

        self.borrowed.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn,
            transport: name,
            _permit: permit,
        })
    }

    async fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let prev = self.borrowed.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // accounting is corrupt for this entry only; restore the counter
            // and refuse to touch the free list
            error!(
                "connection released to '{}' pool that was never borrowed",
                self.transport.name()
            );
            self.borrowed.fetch_add(1, Ordering::SeqCst);
            return;
        }

        if healthy {
            let mut idle = self.idle.lock().await;
            if idle.len() >= self.config.max_connections {
                error!(
                    "'{}' free list exceeds capacity, closing surplus connection",
                    self.transport.name()
                );
                let _ = conn.conn.close().await;
                return;
            }
            idle.push(IdleConnection {
                conn: conn.conn,
                last_used: Instant::now(),
            });
        } else {
            debug!("closing unhealthy '{}' connection", self.transport.name());
            if let Err(e) = conn.conn.close().await {
                trace!("close after unhealthy release failed: {e}");
            }
            // replacement is dialed lazily by the next borrow
        }
    }

    /// Evict idle connections older than the idle timeout, always keeping
    /// `min_idle` of the freshest around.
    async fn sweep(&self, now: Instant) -> Vec<Box<dyn Connection>> {
        let mut idle = self.idle.lock().await;
        idle.sort_by_key(|c| c.last_used);

        let mut evicted = Vec::new();
        while idle.len() > self.config.min_idle {
            let oldest = &idle[0];
            if now.duration_since(oldest.last_used) < self.config.idle_timeout() {
                break;
            }
            evicted.push(idle.remove(0).conn);
        }
        evicted
    }

    fn utilization(&self) -> PoolUtilization {
        PoolUtilization {
            transport: self.transport.name().to_string(),
            in_use: self.borrowed.load(Ordering::SeqCst),
            idle: 0, // filled by the async caller, the free list needs a lock
            max: self.config.max_connections,
        }
    }
}

/// Point-in-time usage numbers for one transport's sub-pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUtilization {
    pub transport: String,
    pub in_use: usize,
    pub idle: usize,
    pub max: usize,
}

/// Pool of broker connections, bounded per transport
pub struct ConnectionPool {
    pools: HashMap<String, TransportPool>,
}

impl ConnectionPool {
    pub fn new(transports: Vec<Arc<dyn Transport>>, config: PoolConfig) -> Self {
        let pools = transports
            .into_iter()
            .map(|t| {
                (
                    t.name().to_string(),
                    TransportPool::new(t, config.clone()),
                )
            })
            .collect();

        Self { pools }
    }

    /// Borrow a connection for `transport`, waiting up to the borrow timeout
    /// for capacity.
    pub async fn borrow(&self, transport: &str) -> PoolResult<PooledConnection> {
        let pool = self
            .pools
            .get(transport)
            .ok_or_else(|| PoolError::UnknownTransport(transport.to_string()))?;

        pool.borrow().await
    }

    /// Give a borrowed connection back. Healthy connections return to the
    /// free list; unhealthy ones are closed and replaced lazily.
    pub async fn release(&self, conn: PooledConnection, healthy: bool) {
        let Some(pool) = self.pools.get(conn.transport()) else {
            error!(
                "released connection for unknown transport '{}'",
                conn.transport()
            );
            return;
        };

        pool.release(conn, healthy).await;
    }

    /// Run one eviction pass over every sub-pool.
    pub async fn sweep_idle(&self) {
        let now = Instant::now();
        for pool in self.pools.values() {
            let evicted = pool.sweep(now).await;
            for mut conn in evicted {
                debug!("evicting idle '{}' connection", pool.transport.name());
                let _ = conn.close().await;
            }
        }
    }

    /// Current usage per transport, for the management snapshot.
    pub async fn utilization(&self) -> Vec<PoolUtilization> {
        let mut stats = Vec::with_capacity(self.pools.len());
        for pool in self.pools.values() {
            let mut u = pool.utilization();
            u.idle = pool.idle.lock().await.len();
            stats.push(u);
        }
        stats.sort_by(|a, b| a.transport.cmp(&b.transport));
        stats
    }

    /// Spawn the periodic idle-eviction task.
    pub fn spawn_maintenance(pool: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        })
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("transports", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}
