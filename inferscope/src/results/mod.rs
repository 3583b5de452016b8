//! Result processing: raw store rows into typed, gap-aware time series.
//!
//! The processor's only contract with the planner is the `field_order`
//! list of selected aliases; trend companions are located by the
//! `<alias>_delta` / `<alias>_percent_change` naming convention, so a new
//! metric gets delta support without processor changes. Dispatch into the
//! four typed assemblers is an exhaustive match over [`MetricName`].
//!
//! Gap-filled rows (synthesized by `WITH FILL`) are recognized by the
//! all-zero UUID sentinel in any grouping column; they register an empty
//! bin for their timestamp so the output timeline has no holes, but they
//! contribute no metric items.
//!
//! Percent-change values may arrive as NaN or ±Inf (a zero previous
//! period); they are sanitized here so callers never see a non-finite
//! number.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::query::metrics::primary_alias;
use crate::query::time_series::TIME_BUCKET_ALIAS;
use crate::store::Row;
use crate::types::{
    CacheMetric, CountMetric, GroupKey, MetricName, MetricValue, MetricsData, MetricsQuery, PerformanceMetric, PeriodBin,
    TimeMetric, GAP_FILL_SENTINEL,
};

/// Column lookup built once per response from the planner's field order.
struct FieldMap {
    present: HashSet<String>,
}

impl FieldMap {
    fn new(field_order: &[String]) -> Self {
        Self {
            present: field_order.iter().cloned().collect(),
        }
    }

    fn has(&self, name: &str) -> bool {
        self.present.contains(name)
    }
}

/// Turn raw rows into ordered period bins for the request that produced
/// them. Output is sorted by timestamp descending regardless of row
/// arrival order.
pub fn process(rows: &[Row], field_order: &[String], query: &MetricsQuery) -> Result<Vec<PeriodBin>, StoreError> {
    let fields = FieldMap::new(field_order);
    let bucket_seconds = query.frequency().bucket_seconds();

    let mut bins: BTreeMap<DateTime<Utc>, Vec<MetricsData>> = BTreeMap::new();

    for row in rows {
        let timestamp = read_timestamp(row, TIME_BUCKET_ALIAS)?;
        let bin = bins.entry(timestamp).or_default();

        if is_gap_row(row, query) {
            continue;
        }

        let mut item = MetricsData::empty();
        for key in &query.group_by {
            let id = read_uuid(row, key.alias());
            match key {
                GroupKey::Model => item.model_id = id,
                GroupKey::Project => item.project_id = id,
                GroupKey::Endpoint => item.endpoint_id = id,
                GroupKey::UserProject => item.user_project_id = id,
            }
        }
        for metric in &query.metrics {
            item.data.insert(*metric, assemble(*metric, row, &fields, bucket_seconds));
        }
        bin.push(item);
    }

    Ok(bins
        .into_iter()
        .rev()
        .map(|(time_period, items)| PeriodBin { time_period, items })
        .collect())
}

/// A row synthesized by gap filling carries default values in every data
/// column: the zero UUID in grouping dimensions, zeros elsewhere. Grouped
/// queries detect the sentinel; ungrouped fill falls back to all-zero
/// primary metric values (a real bucket always aggregates at least one
/// underlying row).
fn is_gap_row(row: &Row, query: &MetricsQuery) -> bool {
    if !query.group_by.is_empty() {
        return query
            .group_by
            .iter()
            .any(|key| read_uuid(row, key.alias()) == Some(GAP_FILL_SENTINEL));
    }
    if !query.fill_time_gaps {
        return false;
    }
    query.metrics.iter().all(|metric| {
        read_f64(row, primary_alias(*metric)).unwrap_or(0.0) == 0.0
    })
}

/// Build the typed value for one metric from one row.
fn assemble(metric: MetricName, row: &Row, fields: &FieldMap, bucket_seconds: i64) -> MetricValue {
    let base = primary_alias(metric);
    let (delta, delta_percent) = read_trend(row, fields, base);

    match metric {
        MetricName::RequestCount => {
            let count = read_i64(row, base).unwrap_or(0);
            MetricValue::Count(CountMetric {
                count,
                rate: Some(round2(count as f64 / bucket_seconds as f64)),
                delta,
                delta_percent,
            })
        }
        MetricName::ErrorCount | MetricName::InputTokens | MetricName::OutputTokens | MetricName::ConcurrentRequests => {
            MetricValue::Count(CountMetric {
                count: read_i64(row, base).unwrap_or(0),
                rate: None,
                delta,
                delta_percent,
            })
        }
        MetricName::Latency => MetricValue::Time(TimeMetric {
            avg_ms: read_f64(row, base).unwrap_or(0.0),
            delta,
            delta_percent,
        }),
        MetricName::Ttft => MetricValue::Performance(PerformanceMetric {
            avg: read_f64(row, base).unwrap_or(0.0),
            p95: read_f64(row, "ttft_p95"),
            p99: read_f64(row, "ttft_p99"),
            delta,
            delta_percent,
        }),
        MetricName::QueuingTime => MetricValue::Performance(PerformanceMetric {
            avg: read_f64(row, base).unwrap_or(0.0),
            p95: read_f64(row, "queuing_time_p95"),
            p99: read_f64(row, "queuing_time_p99"),
            delta,
            delta_percent,
        }),
        MetricName::CacheHitRate => MetricValue::Cache(CacheMetric {
            hit_rate: read_f64(row, base).unwrap_or(0.0),
            hit_count: read_i64(row, "cache_hit_count").unwrap_or(0),
            avg_latency_ms: read_f64(row, "cache_avg_latency_ms"),
            delta,
            delta_percent,
        }),
    }
}

/// Locate the trend companions for a base column by naming convention.
fn read_trend(row: &Row, fields: &FieldMap, base: &str) -> (Option<f64>, Option<f64>) {
    let delta_name = format!("{base}_delta");
    let percent_name = format!("{base}_percent_change");

    let delta = fields.has(&delta_name).then(|| read_f64(row, &delta_name).unwrap_or(0.0));
    let percent = fields
        .has(&percent_name)
        .then(|| sanitize_percent(read_numeric(row, &percent_name).unwrap_or(0.0)));
    (delta, percent)
}

/// NaN and infinity mapping for percent-change values: NaN (0/0, no prior
/// period) becomes 0.0; +Inf (growth from zero) becomes 100.0; −Inf
/// becomes −100.0. Finite values pass through.
pub fn sanitize_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else if value == f64::INFINITY {
        100.0
    } else if value == f64::NEG_INFINITY {
        -100.0
    } else {
        value
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn read_f64(row: &Row, name: &str) -> Option<f64> {
    match row.get(name)? {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Like [`read_f64`] but also decodes the store's textual denormals
/// (`"nan"`, `"inf"`, `"-inf"`), which JSON cannot carry as numbers.
fn read_numeric(row: &Row, name: &str) -> Option<f64> {
    match row.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim() {
            "nan" | "NaN" => Some(f64::NAN),
            "inf" | "+inf" | "Infinity" => Some(f64::INFINITY),
            "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

fn read_i64(row: &Row, name: &str) -> Option<i64> {
    match row.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn read_uuid(row: &Row, name: &str) -> Option<Uuid> {
    match row.get(name)? {
        Value::String(s) => Uuid::parse_str(s).ok(),
        _ => None,
    }
}

/// Bucket timestamps arrive as `YYYY-MM-DD HH:MM:SS[.fff]` from the store's
/// JSON row format; RFC 3339 is accepted for robustness.
fn read_timestamp(row: &Row, name: &str) -> Result<DateTime<Utc>, StoreError> {
    let value = row.get(name).ok_or_else(|| StoreError::Decode {
        message: format!("missing column '{name}'"),
    })?;
    let text = value.as_str().ok_or_else(|| StoreError::Decode {
        message: format!("column '{name}' is not a timestamp string"),
    })?;

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Decode {
            message: format!("invalid timestamp '{text}': {e}"),
        })
}
