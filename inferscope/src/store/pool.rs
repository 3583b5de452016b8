//! Async connection pool with failure-driven eviction.
//!
//! The pool holds between `min_connections` (established at startup,
//! optionally warmed) and `max_connections` connections. Acquisition is a
//! scoped operation: the returned [`PooledConnection`] carries a semaphore
//! permit and returns its connection to the idle set when dropped, on every
//! exit path including cancellation. A connection that carried a failed
//! query must not re-enter the pool in an unknown state; callers remove it
//! with [`PooledConnection::discard`] and the next acquisition dials a
//! replacement.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PoolConfig;
use crate::errors::StoreError;

use super::{Connection, Connector};

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    /// Idle connections; protected by a plain mutex, only held for push/pop.
    idle: Mutex<Vec<Arc<dyn Connection>>>,
    /// One permit per allowed connection (idle or checked out).
    slots: Arc<Semaphore>,
    closed: AtomicBool,
    connections_created: AtomicUsize,
    connections_discarded: AtomicUsize,
}

impl ConnectionPool {
    /// Build the pool and establish `min_connections` eagerly. With
    /// `warmup` set, each startup connection runs a trivial query so the
    /// first real request does not pay connection setup costs.
    pub async fn new(connector: Arc<dyn Connector>, config: &PoolConfig) -> Result<Self, StoreError> {
        let pool = Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(config.max_connections)),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            closed: AtomicBool::new(false),
            connections_created: AtomicUsize::new(0),
            connections_discarded: AtomicUsize::new(0),
        };

        for _ in 0..config.min_connections {
            let conn = pool.dial().await?;
            if config.warmup {
                conn.ping().await?;
            }
            pool.idle.lock().expect("pool idle lock poisoned").push(conn);
        }
        debug!(min = config.min_connections, max = config.max_connections, "connection pool initialized");
        Ok(pool)
    }

    async fn dial(&self) -> Result<Arc<dyn Connection>, StoreError> {
        let conn = self.connector.connect().await?;
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Check out a connection, waiting for a slot when the pool is at
    /// capacity. Dials a fresh connection when no idle one is available
    /// (first use, or after a discard).
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;

        let idle = self.idle.lock().expect("pool idle lock poisoned").pop();
        let conn = match idle {
            Some(conn) => conn,
            // The permit guarantees we stay under max_connections; if the
            // dial fails the permit drops with this frame and frees the slot.
            None => self.dial().await?,
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            _permit: permit,
        })
    }

    fn release(&self, conn: Arc<dyn Connection>) {
        if !self.closed.load(Ordering::Acquire) {
            self.idle.lock().expect("pool idle lock poisoned").push(conn);
        }
    }

    /// Stop handing out connections and drop the idle set. In-flight
    /// connections are dropped as their guards release.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.idle.lock().expect("pool idle lock poisoned").clear();
    }

    /// Total connections dialed over the pool's lifetime.
    pub fn connections_created(&self) -> usize {
        self.connections_created.load(Ordering::Relaxed)
    }

    /// Connections evicted after failed queries.
    pub fn connections_discarded(&self) -> usize {
        self.connections_discarded.load(Ordering::Relaxed)
    }
}

/// RAII guard over a checked-out connection. Returns the connection to the
/// pool on drop unless it was discarded.
#[must_use]
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Arc<dyn Connection>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        self.conn.as_ref().expect("connection taken before drop")
    }

    /// Remove this connection from the pool instead of returning it. Used
    /// after an execution error: a half-consumed or errored connection
    /// cannot be safely reused.
    pub fn discard(mut self) {
        self.conn = None;
        self.pool.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{QueryParams, Row, RowStream};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn query(&self, _sql: &str, _params: &QueryParams) -> Result<Vec<Row>, StoreError> {
            Ok(vec![])
        }

        async fn query_stream(&self, _sql: &str, _params: &QueryParams) -> Result<RowStream, StoreError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn insert(&self, _sql: &str, _body: String) -> Result<(), StoreError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError> {
            Ok(Arc::new(NullConnection))
        }
    }

    fn pool_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            connect_timeout: Duration::from_secs(1),
            warmup: false,
        }
    }

    #[tokio::test]
    async fn establishes_min_connections_at_startup() {
        let pool = ConnectionPool::new(Arc::new(NullConnector), &pool_config(3, 8)).await.unwrap();
        assert_eq!(pool.connections_created(), 3);
    }

    #[tokio::test]
    async fn acquire_reuses_idle_connections() {
        let pool = Arc::new(ConnectionPool::new(Arc::new(NullConnector), &pool_config(1, 4)).await.unwrap());

        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            drop(conn);
        }
        // Only the startup connection was ever dialed
        assert_eq!(pool.connections_created(), 1);
    }

    #[tokio::test]
    async fn discard_forces_a_fresh_dial() {
        let pool = Arc::new(ConnectionPool::new(Arc::new(NullConnector), &pool_config(1, 4)).await.unwrap());

        let conn = pool.acquire().await.unwrap();
        conn.discard();
        assert_eq!(pool.connections_discarded(), 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.connections_created(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_slot_at_capacity() {
        let pool = Arc::new(ConnectionPool::new(Arc::new(NullConnector), &pool_config(0, 1)).await.unwrap());

        let held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(drop) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "waiter should block while the slot is held");

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquisition() {
        let pool = Arc::new(ConnectionPool::new(Arc::new(NullConnector), &pool_config(1, 2)).await.unwrap());
        pool.close();
        assert!(matches!(pool.acquire().await, Err(StoreError::Closed)));
    }
}
