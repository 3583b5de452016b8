//! Store execution layer: pooling, concurrency limiting, caching, and
//! failure isolation for queries against the columnar store.
//!
//! The [`StoreClient`] is a process-scoped value constructed once at
//! startup and passed by reference; it owns a connection pool, a semaphore
//! bounding in-flight queries independently of pool size, and an optional
//! result cache. Saturating the semaphore queues new queries rather than
//! rejecting them, which is the primary protection for the backing store
//! against bursty analytics traffic.
//!
//! Failure isolation: an execution error discards the connection that
//! carried it (fatal for the connection, not for the client) and surfaces
//! a transient error; the caller may retry the whole request. A failed
//! query yields zero rows, never a truncated set.

pub mod cache;
pub mod http;
pub mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::errors::{StoreError, sql_preview};
use crate::query::escape::validate_identifier;

use cache::QueryCache;
use http::HttpConnector;
use pool::ConnectionPool;

/// One result row: a dynamic column→value map, as decoded from the store's
/// JSON row format.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Bind parameters by name. Ordered so identical requests hash identically.
pub type QueryParams = BTreeMap<String, String>;

/// Streaming query results.
pub type RowStream = BoxStream<'static, Result<Row, StoreError>>;

/// A single store connection. The engine talks to the store exclusively
/// through this trait, so tests substitute instrumented fakes without any
/// network.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn query(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, StoreError>;
    async fn query_stream(&self, sql: &str, params: &QueryParams) -> Result<RowStream, StoreError>;
    async fn insert(&self, sql: &str, body: String) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Dials new [`Connection`]s for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError>;
}

/// Pooled, concurrency-limited, cache-aware store client.
pub struct StoreClient {
    pool: Arc<ConnectionPool>,
    /// Binding concurrency cap, independent of pool size.
    query_permits: Arc<Semaphore>,
    cache: Option<QueryCache>,
    closed: AtomicBool,
}

impl StoreClient {
    /// Connect to the store configured in `config` and prepare the pool.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let connector = Arc::new(HttpConnector::new(&config.store, &config.pool));
        Self::with_connector(connector, config).await
    }

    /// Build a client over an explicit connector. Tests use this to inject
    /// instrumented fakes.
    pub async fn with_connector(connector: Arc<dyn Connector>, config: &Config) -> Result<Self, StoreError> {
        let pool = Arc::new(ConnectionPool::new(connector, &config.pool).await?);
        let cache = config.cache.enabled.then(|| QueryCache::new(&config.cache));
        Ok(Self {
            pool,
            query_permits: Arc::new(Semaphore::new(config.query.max_concurrent)),
            cache,
            closed: AtomicBool::new(false),
        })
    }

    /// Execute a statement and fetch all rows.
    ///
    /// A cache hit returns without touching the semaphore or the pool.
    /// Otherwise the call suspends until a query permit and a pooled
    /// connection are available; both are released on every exit path.
    #[instrument(skip_all, err)]
    pub async fn execute(&self, sql: &str, params: &QueryParams, use_cache: bool) -> Result<Vec<Row>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        if use_cache
            && let Some(cache) = &self.cache
            && let Some(rows) = cache.get(sql, params).await
        {
            debug!(rows = rows.len(), "query cache hit");
            return Ok((*rows).clone());
        }

        let _permit = self
            .query_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let conn = self.pool.acquire().await?;

        let started = Instant::now();
        match conn.connection().query(sql, params).await {
            Ok(rows) => {
                debug!(duration_ms = started.elapsed().as_millis() as u64, rows = rows.len(), "store query executed");
                if use_cache && let Some(cache) = &self.cache {
                    cache.insert(sql, params, Arc::new(rows.clone())).await;
                }
                Ok(rows)
            }
            Err(e) => {
                warn!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    sql = %sql_preview(sql),
                    "store query failed, discarding connection"
                );
                conn.discard();
                Err(e)
            }
        }
    }

    /// Execute a statement and stream rows without buffering the result
    /// set. Uncached by design: large scans would evict every useful entry.
    /// The permit and connection stay held until the stream is dropped or
    /// exhausted; a mid-stream error discards the connection.
    pub async fn execute_stream(&self, sql: &str, params: &QueryParams) -> Result<RowStream, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let permit = self
            .query_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let conn = self.pool.acquire().await?;

        let inner = match conn.connection().query_stream(sql, params).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, sql = %sql_preview(sql), "store query failed, discarding connection");
                conn.discard();
                return Err(e);
            }
        };

        let guarded = futures::stream::unfold(
            (inner, Some(conn), permit),
            |(mut inner, mut conn, permit)| async move {
                match inner.next().await {
                    Some(Ok(row)) => Some((Ok(row), (inner, conn, permit))),
                    Some(Err(e)) => {
                        if let Some(conn) = conn.take() {
                            conn.discard();
                        }
                        Some((Err(e), (inner, conn, permit)))
                    }
                    None => None,
                }
            },
        );
        Ok(Box::pin(guarded))
    }

    /// Insert rows into a table. Table and column names are validated
    /// against identifier rules before any SQL is assembled.
    #[instrument(skip(self, rows), err)]
    pub async fn insert(&self, table: &str, columns: &[&str], rows: &[serde_json::Value]) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        validate_identifier(table).map_err(StoreError::InvalidIdentifier)?;
        for column in columns {
            validate_identifier(column).map_err(StoreError::InvalidIdentifier)?;
        }
        if rows.is_empty() {
            return Ok(());
        }

        let sql = format!("INSERT INTO {} ({}) FORMAT JSONEachRow", table, columns.join(", "));
        let body = rows
            .iter()
            .map(|row| row.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let _permit = self
            .query_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let conn = self.pool.acquire().await?;
        match conn.connection().insert(&sql, body).await {
            Ok(()) => {
                debug!(rows = rows.len(), table, "rows inserted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, table, "insert failed, discarding connection");
                conn.discard();
                Err(e)
            }
        }
    }

    /// Ordered teardown: stop accepting new work, close the permit
    /// semaphore so queued waiters resolve, then drop pooled connections.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.query_permits.close();
        self.pool.close();
        debug!("store client closed");
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
