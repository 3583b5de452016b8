//! # inferscope: Metrics Query Engine for Inference Telemetry
//!
//! `inferscope` answers time-bucketed analytics questions ("request count,
//! latency, cache-hit-rate, grouped by project, per hour, for the last 7
//! days, top-10 projects") against a columnar store holding per-inference
//! telemetry rows. It is the query core of an LLM observability platform:
//! the HTTP/API surface, ingestion pipeline, and workflow orchestration
//! live in the embedding services and are out of scope here.
//!
//! ## Overview
//!
//! The engine turns a declarative [`MetricsQuery`] — metrics, time window,
//! bucket frequency, dimension filters, grouping, optional trend deltas and
//! top-k ranking — into one parameterized ClickHouse statement, executes it
//! under bounded concurrency with pooling and caching, and processes the
//! raw rows back into typed, gap-aware, newest-first time series.
//!
//! Three properties drive the design:
//!
//! - **Injection safety.** Every identifier in generated SQL comes from a
//!   fixed, code-owned allowlist; filter values (UUIDs) pass through one
//!   quoting function; the only bind parameters are the date-range bounds.
//!   Caller strings never reach SQL as identifiers.
//! - **Bounded load.** A semaphore caps in-flight store queries
//!   independently of pool size. When saturated, new requests queue rather
//!   than fail, protecting the store from bursty analytics traffic.
//! - **Numerically sane output.** Percent-change values that divide by a
//!   zero previous period are sanitized (NaN→0, ±Inf→±100); callers never
//!   see a non-finite number.
//!
//! ## Architecture
//!
//! The **planner** ([`query`]) composes per-metric column definitions, CTEs
//! (overlap concurrency, top-k ranking), filters, grouping, trend-delta
//! window functions, and `WITH FILL` gap filling into one statement plus an
//! ordered field list — the column contract the processor relies on.
//!
//! The **store client** ([`store`]) owns an async connection pool over the
//! store's HTTP interface, the concurrency semaphore, and an LRU+TTL result
//! cache. A connection that carried a failed query is discarded rather than
//! returned to the pool; cache problems degrade to misses, never failures.
//!
//! The **result processor** ([`results`]) maps raw rows into typed
//! [`PeriodBin`]s: four metric value kinds, trend companions located by
//! naming convention, gap rows recognized by the all-zero UUID sentinel.
//!
//! [`QueryEngine`] ties the three together and is the only entry point the
//! embedding service needs.
//!
//! ## Quick start
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use inferscope::{Config, MetricsQuery, QueryEngine};
//! use inferscope::types::{FrequencyUnit, GroupKey, MetricName};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     inferscope::telemetry::init_telemetry()?;
//!
//!     let config = Config::default();
//!     let engine = QueryEngine::connect(&config).await?;
//!
//!     let mut query = MetricsQuery::new(
//!         vec![MetricName::RequestCount, MetricName::Ttft],
//!         Utc::now() - Duration::days(7),
//!         FrequencyUnit::Hour,
//!     );
//!     query.group_by = vec![GroupKey::Project];
//!     query.top_k = Some(10);
//!
//!     let bins = engine.build_and_execute(&query).await?;
//!     for bin in bins {
//!         println!("{}: {} groups", bin.time_period, bin.items.len());
//!     }
//!
//!     engine.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module: YAML file plus `INFERSCOPE_`-prefixed
//! environment overrides, covering store endpoint, pool sizing, the
//! concurrency cap, and cache bounds.

pub mod config;
pub mod engine;
pub mod errors;
pub mod query;
pub mod results;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use engine::QueryEngine;
pub use errors::{Error, PlanningError, Result, StoreError};
pub use types::{MetricsQuery, PeriodBin};
