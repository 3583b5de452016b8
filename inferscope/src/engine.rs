//! The query engine facade.
//!
//! [`QueryEngine`] wires the planner, the store client, and the result
//! processor into the two operations exposed to the API layer:
//! [`build_and_execute`](QueryEngine::build_and_execute) for planned
//! metrics queries and [`execute_raw`](QueryEngine::execute_raw) for
//! callers that bring their own statements (the static-query
//! cluster-metrics service reuses pooling and caching through it).
//!
//! The engine is an explicitly constructed value: build one at process
//! start, share it by reference, and call [`close`](QueryEngine::close) on
//! shutdown. There are no global singletons.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::Config;
use crate::errors::{Result, sql_preview};
use crate::query;
use crate::results;
use crate::store::{Connector, QueryParams, Row, RowStream, StoreClient};
use crate::types::{MetricsQuery, PeriodBin};

pub struct QueryEngine {
    client: StoreClient,
}

impl QueryEngine {
    /// Connect to the configured store and prepare the pool, semaphore,
    /// and cache.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = StoreClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Build an engine over an explicit connector; used by tests to run
    /// the full pipeline against an instrumented fake store.
    pub async fn with_connector(connector: Arc<dyn Connector>, config: &Config) -> Result<Self> {
        let client = StoreClient::with_connector(connector, config).await?;
        Ok(Self { client })
    }

    /// Plan, execute, and process one metrics query.
    ///
    /// Planning errors short-circuit before the store is touched.
    /// Execution errors surface as transient failures with no partial
    /// results; the whole request is safe to retry.
    #[instrument(skip_all, err)]
    pub async fn build_and_execute(&self, query: &MetricsQuery) -> Result<Vec<PeriodBin>> {
        let planned = query::build(query)?;
        debug!(sql = %sql_preview(&planned.sql), fields = planned.field_order.len(), "planned metrics query");

        let rows = self.client.execute(&planned.sql, &planned.params, true).await?;
        let bins = results::process(&rows, &planned.field_order, query)?;
        Ok(bins)
    }

    /// Execute a caller-supplied statement through the shared pool,
    /// semaphore, and cache, bypassing the planner.
    pub async fn execute_raw(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>> {
        Ok(self.client.execute(sql, params, true).await?)
    }

    /// Stream a caller-supplied statement's rows without buffering.
    pub async fn execute_raw_stream(&self, sql: &str, params: &QueryParams) -> Result<RowStream> {
        Ok(self.client.execute_stream(sql, params).await?)
    }

    /// The underlying store client, for collaborators that need the insert
    /// path.
    pub fn store(&self) -> &StoreClient {
        &self.client
    }

    /// Ordered shutdown: stop accepting work, then drain and close the
    /// pool.
    pub async fn close(&self) {
        self.client.close().await;
    }
}
