//! Common type definitions for the metrics query engine.
//!
//! This module defines:
//! - Type aliases for entity IDs (ProjectId, ModelId, etc.)
//! - The closed metric, filter-key, and group-key enums the planner accepts
//! - The [`MetricsQuery`] request consumed by the engine
//! - The typed time-series output model ([`PeriodBin`], [`MetricsData`],
//!   [`MetricValue`])
//!
//! # Metric registry keys
//!
//! [`MetricName`] is the single source of truth for which metrics exist.
//! The query planner and the result processor both dispatch on it with
//! exhaustive matches, so adding a variant forces both sides to be updated
//! before the crate compiles.
//!
//! # Request validation boundary
//!
//! [`MetricsQuery`] arrives pre-validated from the API layer: `from_date <=
//! to_date`, the range is at most 90 days, `to_date` is no more than one day
//! in the future, filter value lists are non-empty at the transport level,
//! and `top_k` implies a non-empty `group_by` with no filters. The engine
//! relies on those invariants (gap-fill step counts in particular) and does
//! not re-check them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Type aliases for IDs
pub type ProjectId = Uuid;
pub type ModelId = Uuid;
pub type EndpointId = Uuid;

/// Sentinel marking synthetic rows produced by gap filling. `WITH FILL`
/// materializes missing time steps with default column values, which for
/// UUID dimension columns is the all-zero UUID.
pub const GAP_FILL_SENTINEL: Uuid = Uuid::nil();

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// The closed set of metrics the engine can plan and process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Number of inference requests per bucket
    RequestCount,
    /// Number of failed inference requests per bucket
    ErrorCount,
    /// Prompt tokens consumed per bucket
    InputTokens,
    /// Completion tokens produced per bucket
    OutputTokens,
    /// End-to-end response latency (average, milliseconds)
    Latency,
    /// Time to first token (average + p95 + p99, milliseconds)
    Ttft,
    /// Scheduler queuing time (average + p95 + p99, milliseconds)
    QueuingTime,
    /// Prompt-cache hit rate, hit count, and cached-path latency
    CacheHitRate,
    /// Peak overlapping requests sharing an arrival timestamp
    ConcurrentRequests,
}

impl MetricName {
    /// All registered metrics, in a stable order. Used by tests to assert
    /// the planner registry is exhaustive.
    pub const ALL: [MetricName; 9] = [
        MetricName::RequestCount,
        MetricName::ErrorCount,
        MetricName::InputTokens,
        MetricName::OutputTokens,
        MetricName::Latency,
        MetricName::Ttft,
        MetricName::QueuingTime,
        MetricName::CacheHitRate,
        MetricName::ConcurrentRequests,
    ];

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::RequestCount => "request_count",
            MetricName::ErrorCount => "error_count",
            MetricName::InputTokens => "input_tokens",
            MetricName::OutputTokens => "output_tokens",
            MetricName::Latency => "latency",
            MetricName::Ttft => "ttft",
            MetricName::QueuingTime => "queuing_time",
            MetricName::CacheHitRate => "cache_hit_rate",
            MetricName::ConcurrentRequests => "concurrent_requests",
        }
    }

    /// Whether a smaller value of this metric ranks better. Drives the
    /// ORDER BY direction of top-k ranking.
    pub fn lower_is_better(&self) -> bool {
        matches!(
            self,
            MetricName::Latency | MetricName::Ttft | MetricName::QueuingTime
        )
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| s.to_string())
    }
}

/// Filter dimensions the planner accepts. Each key maps to exactly one
/// qualified column through the allowlist in [`crate::query::escape`];
/// caller strings never reach SQL as identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKey {
    Model,
    Project,
    Endpoint,
    UserProject,
}

impl FilterKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKey::Model => "model",
            FilterKey::Project => "project",
            FilterKey::Endpoint => "endpoint",
            FilterKey::UserProject => "user_project",
        }
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(FilterKey::Model),
            "project" => Ok(FilterKey::Project),
            "endpoint" => Ok(FilterKey::Endpoint),
            "user_project" => Ok(FilterKey::UserProject),
            other => Err(other.to_string()),
        }
    }
}

/// Grouping dimensions. Same closed set as [`FilterKey`]; kept as a distinct
/// type so a filter key can never be passed where a group key is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Model,
    Project,
    Endpoint,
    UserProject,
}

impl GroupKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKey::Model => "model",
            GroupKey::Project => "project",
            GroupKey::Endpoint => "endpoint",
            GroupKey::UserProject => "user_project",
        }
    }

    /// The output column alias this dimension appears under.
    pub fn alias(&self) -> &'static str {
        match self {
            GroupKey::Model => "model_id",
            GroupKey::Project => "project_id",
            GroupKey::Endpoint => "endpoint_id",
            GroupKey::UserProject => "user_project_id",
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(GroupKey::Model),
            "project" => Ok(GroupKey::Project),
            "endpoint" => Ok(GroupKey::Endpoint),
            "user_project" => Ok(GroupKey::UserProject),
            other => Err(other.to_string()),
        }
    }
}

/// A filter value: one UUID or a list of UUIDs. A list renders as `IN (...)`,
/// a single value as `=`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(Uuid),
    Many(Vec<Uuid>),
}

impl FilterValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FilterValue::One(_) => false,
            FilterValue::Many(v) => v.is_empty(),
        }
    }
}

/// Time bucket width units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyUnit {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl FrequencyUnit {
    /// Width of one unit in seconds, used for custom-interval bucket
    /// alignment. Month/quarter/year use fixed 30/90/365-day approximations
    /// rather than calendar arithmetic; custom intervals are uniform by
    /// construction.
    pub fn seconds(&self) -> i64 {
        match self {
            FrequencyUnit::Hour => 3_600,
            FrequencyUnit::Day => 86_400,
            FrequencyUnit::Week => 604_800,
            FrequencyUnit::Month => 2_592_000,
            FrequencyUnit::Quarter => 7_776_000,
            FrequencyUnit::Year => 31_536_000,
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrequencyUnit::Hour => "hour",
            FrequencyUnit::Day => "day",
            FrequencyUnit::Week => "week",
            FrequencyUnit::Month => "month",
            FrequencyUnit::Quarter => "quarter",
            FrequencyUnit::Year => "year",
        };
        f.write_str(s)
    }
}

/// A resolved bucketing frequency. `interval: None` buckets with the native
/// truncation function for the unit; `interval: Some(n)` buckets into
/// `n * unit` wide windows aligned to the request's `from_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    pub unit: FrequencyUnit,
    pub interval: Option<u32>,
}

impl Frequency {
    pub fn new(unit: FrequencyUnit, interval: Option<u32>) -> Self {
        Self { unit, interval }
    }

    /// Bucket width in seconds.
    pub fn bucket_seconds(&self) -> i64 {
        self.unit.seconds() * i64::from(self.interval.unwrap_or(1))
    }
}

/// A declarative analytics request, already validated by the API layer.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    /// Metrics to compute; at least one.
    pub metrics: Vec<MetricName>,
    /// Inclusive window start.
    pub from_date: DateTime<Utc>,
    /// Inclusive window end; defaults to now at planning time.
    #[serde(default)]
    pub to_date: Option<DateTime<Utc>>,
    /// Bucket width unit.
    pub frequency_unit: FrequencyUnit,
    /// Optional custom bucket multiplier (>= 1).
    #[serde(default)]
    pub frequency_interval: Option<u32>,
    /// Dimension filters; mutually exclusive with `top_k`.
    #[serde(default)]
    pub filters: HashMap<FilterKey, FilterValue>,
    /// Grouping dimensions, in output order.
    #[serde(default)]
    pub group_by: Vec<GroupKey>,
    /// Emit previous-period delta and percent-change companions.
    #[serde(default)]
    pub return_delta: bool,
    /// Synthesize empty buckets for time steps with no data.
    #[serde(default)]
    pub fill_time_gaps: bool,
    /// Keep only the K best-ranked groups (requires `group_by`).
    #[serde(default)]
    pub top_k: Option<u32>,
}

impl MetricsQuery {
    /// Minimal request: one metric over a window, hourly buckets.
    pub fn new(metrics: Vec<MetricName>, from_date: DateTime<Utc>, frequency_unit: FrequencyUnit) -> Self {
        Self {
            metrics,
            from_date,
            to_date: None,
            frequency_unit,
            frequency_interval: None,
            filters: HashMap::new(),
            group_by: Vec::new(),
            return_delta: false,
            fill_time_gaps: false,
            top_k: None,
        }
    }

    pub fn frequency(&self) -> Frequency {
        Frequency::new(self.frequency_unit, self.frequency_interval)
    }
}

/// One time bucket of output. `items` is empty for gap-filled buckets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodBin {
    pub time_period: DateTime<Utc>,
    pub items: Vec<MetricsData>,
}

/// Metric values for one group (or the whole window when ungrouped) within
/// one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<ModelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<EndpointId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_project_id: Option<ProjectId>,
    pub data: HashMap<MetricName, MetricValue>,
}

impl MetricsData {
    pub fn empty() -> Self {
        Self {
            model_id: None,
            project_id: None,
            endpoint_id: None,
            user_project_id: None,
            data: HashMap::new(),
        }
    }
}

/// A typed metric value. Untagged so the serialized shape matches the
/// per-kind structs directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(CountMetric),
    Time(TimeMetric),
    Performance(PerformanceMetric),
    Cache(CacheMetric),
}

/// Counter-style metric (request counts, token totals, concurrency peaks).
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CountMetric {
    pub count: i64,
    /// Events per second across the bucket; only populated for request_count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent: Option<f64>,
}

/// Single-average duration metric (end-to-end latency).
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TimeMetric {
    pub avg_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent: Option<f64>,
}

/// Average plus tail percentiles (ttft, queuing time).
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PerformanceMetric {
    pub avg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent: Option<f64>,
}

/// Prompt-cache effectiveness metric.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CacheMetric {
    pub hit_rate: f64,
    pub hit_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_name_round_trips_through_str() {
        for metric in MetricName::ALL {
            assert_eq!(metric.as_str().parse::<MetricName>(), Ok(metric));
        }
        assert!("not_a_metric".parse::<MetricName>().is_err());
    }

    #[test]
    fn lower_is_better_only_for_duration_metrics() {
        assert!(MetricName::Latency.lower_is_better());
        assert!(MetricName::Ttft.lower_is_better());
        assert!(MetricName::QueuingTime.lower_is_better());
        assert!(!MetricName::RequestCount.lower_is_better());
        assert!(!MetricName::ConcurrentRequests.lower_is_better());
    }

    #[test]
    fn frequency_bucket_seconds() {
        let hourly = Frequency::new(FrequencyUnit::Hour, None);
        assert_eq!(hourly.bucket_seconds(), 3_600);

        let six_hourly = Frequency::new(FrequencyUnit::Hour, Some(6));
        assert_eq!(six_hourly.bucket_seconds(), 21_600);

        let quarterly = Frequency::new(FrequencyUnit::Quarter, None);
        assert_eq!(quarterly.bucket_seconds(), 7_776_000);
    }

    #[test]
    fn filter_value_emptiness() {
        assert!(!FilterValue::One(Uuid::new_v4()).is_empty());
        assert!(FilterValue::Many(vec![]).is_empty());
        assert!(!FilterValue::Many(vec![Uuid::new_v4()]).is_empty());
    }

    #[test]
    fn metrics_query_deserializes_with_defaults() {
        let query: MetricsQuery = serde_json::from_str(
            r#"{
                "metrics": ["request_count", "ttft"],
                "from_date": "2024-01-01T00:00:00Z",
                "frequency_unit": "hour"
            }"#,
        )
        .unwrap();
        assert_eq!(query.metrics, vec![MetricName::RequestCount, MetricName::Ttft]);
        assert!(query.to_date.is_none());
        assert!(query.filters.is_empty());
        assert!(!query.return_delta);
        assert!(query.top_k.is_none());
    }
}
