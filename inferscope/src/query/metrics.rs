//! The metric registry: what each metric selects, which tables it needs,
//! and how it ranks for top-k.
//!
//! Definitions are built fresh per plan because delta companions embed the
//! request's grouping dimensions. Dispatch is an exhaustive match on
//! [`MetricName`], so a new metric variant cannot compile without a
//! registered builder here.

use crate::types::MetricName;

use super::cte::CteKind;
use super::time_series::TIME_BUCKET_ALIAS;

/// Base tables a metric can require. `Details` anchors every query;
/// `Metrics` joins per-request measurements on the shared request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Table {
    Details,
    Metrics,
}

impl Table {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Table::Details => "inference_details",
            Table::Metrics => "inference_metrics",
        }
    }

    pub fn alias(&self) -> &'static str {
        match self {
            Table::Details => "d",
            Table::Metrics => "f",
        }
    }
}

/// How the ranking CTE scores a metric's groups when it is the top-k
/// ranking metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopKSource {
    /// Rank directly on this aggregate expression (no alias).
    Expression(String),
    /// Rank via the concurrency template (aggregate over sub-aggregate).
    ConcurrencyAverage,
}

/// One output column of a metric. A logical metric can contribute several
/// definitions (average plus tail percentiles, rate plus count).
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    /// Output column alias; also the key the result processor reads.
    pub alias: String,
    /// Full select clause including the `AS alias` suffix.
    pub select_clause: String,
    /// Base tables this clause references.
    pub required_tables: Vec<Table>,
    /// CTE this metric needs registered and joined.
    pub cte: Option<CteKind>,
    /// Whether trend-delta companions attach to this column.
    pub trend_base: bool,
    /// Ranking source when this metric leads a top-k query.
    pub top_k: Option<TopKSource>,
}

impl MetricDefinition {
    fn new(alias: &str, select_expr: &str, required_tables: Vec<Table>) -> Self {
        Self {
            alias: alias.to_string(),
            select_clause: format!("{select_expr} AS {alias}"),
            required_tables,
            cte: None,
            trend_base: false,
            top_k: None,
        }
    }

    fn trend_base(mut self) -> Self {
        self.trend_base = true;
        self
    }

    fn ranked_by_own_expression(mut self, expr: &str) -> Self {
        self.top_k = Some(TopKSource::Expression(expr.to_string()));
        self
    }
}

/// Output alias carrying the metric's headline value. The result processor
/// reads this column and its `_delta`/`_percent_change` companions.
pub fn primary_alias(metric: MetricName) -> &'static str {
    match metric {
        MetricName::RequestCount => "request_count",
        MetricName::ErrorCount => "error_count",
        MetricName::InputTokens => "input_tokens",
        MetricName::OutputTokens => "output_tokens",
        MetricName::Latency => "avg_latency_ms",
        MetricName::Ttft => "avg_ttft_ms",
        MetricName::QueuingTime => "avg_queuing_time_ms",
        MetricName::CacheHitRate => "cache_hit_rate",
        MetricName::ConcurrentRequests => "concurrent_requests",
    }
}

/// Build the column definitions for one requested metric.
pub fn definitions_for(metric: MetricName) -> Vec<MetricDefinition> {
    match metric {
        MetricName::RequestCount => vec![
            MetricDefinition::new("request_count", "COUNT(d.request_id)", vec![Table::Details])
                .trend_base()
                .ranked_by_own_expression("COUNT(d.request_id)"),
        ],
        MetricName::ErrorCount => vec![
            MetricDefinition::new("error_count", "countIf(d.is_success = false)", vec![Table::Details])
                .trend_base()
                .ranked_by_own_expression("countIf(d.is_success = false)"),
        ],
        MetricName::InputTokens => vec![
            MetricDefinition::new("input_tokens", "SUM(f.input_tokens)", vec![Table::Details, Table::Metrics])
                .trend_base()
                .ranked_by_own_expression("SUM(f.input_tokens)"),
        ],
        MetricName::OutputTokens => vec![
            MetricDefinition::new("output_tokens", "SUM(f.output_tokens)", vec![Table::Details, Table::Metrics])
                .trend_base()
                .ranked_by_own_expression("SUM(f.output_tokens)"),
        ],
        MetricName::Latency => vec![
            MetricDefinition::new(
                "avg_latency_ms",
                "round(avg(f.response_time_ms), 2)",
                vec![Table::Details, Table::Metrics],
            )
            .trend_base()
            .ranked_by_own_expression("avg(f.response_time_ms)"),
        ],
        MetricName::Ttft => vec![
            MetricDefinition::new("avg_ttft_ms", "round(avg(f.ttft_ms), 2)", vec![Table::Details, Table::Metrics])
                .trend_base()
                .ranked_by_own_expression("avg(f.ttft_ms)"),
            MetricDefinition::new(
                "ttft_p95",
                "round(quantile(0.95)(f.ttft_ms), 2)",
                vec![Table::Details, Table::Metrics],
            ),
            MetricDefinition::new(
                "ttft_p99",
                "round(quantile(0.99)(f.ttft_ms), 2)",
                vec![Table::Details, Table::Metrics],
            ),
        ],
        MetricName::QueuingTime => vec![
            MetricDefinition::new(
                "avg_queuing_time_ms",
                "round(avg(f.queuing_time_ms), 2)",
                vec![Table::Details, Table::Metrics],
            )
            .trend_base()
            .ranked_by_own_expression("avg(f.queuing_time_ms)"),
            MetricDefinition::new(
                "queuing_time_p95",
                "round(quantile(0.95)(f.queuing_time_ms), 2)",
                vec![Table::Details, Table::Metrics],
            ),
            MetricDefinition::new(
                "queuing_time_p99",
                "round(quantile(0.99)(f.queuing_time_ms), 2)",
                vec![Table::Details, Table::Metrics],
            ),
        ],
        MetricName::CacheHitRate => vec![
            MetricDefinition::new(
                "cache_hit_rate",
                "round(countIf(d.cached) / COUNT(d.request_id) * 100, 2)",
                vec![Table::Details],
            )
            .trend_base()
            .ranked_by_own_expression("countIf(d.cached) / COUNT(d.request_id)"),
            MetricDefinition::new("cache_hit_count", "countIf(d.cached)", vec![Table::Details]),
            MetricDefinition::new(
                "cache_avg_latency_ms",
                "round(avgIf(f.cache_latency_ms, d.cached), 2)",
                vec![Table::Details, Table::Metrics],
            ),
        ],
        MetricName::ConcurrentRequests => {
            let mut def = MetricDefinition::new(
                "concurrent_requests",
                "COALESCE(MAX(cr.concurrent_count), 0)",
                vec![Table::Details],
            )
            .trend_base();
            def.cte = Some(CteKind::Concurrency);
            def.top_k = Some(TopKSource::ConcurrencyAverage);
            vec![def]
        }
    }
}

/// Build the trend-delta companion columns for a base alias: the previous
/// period's value via `lagInFrame`, the rounded difference, and the rounded
/// percent change. Percent change may evaluate to NaN or ±Inf; the result
/// processor sanitizes it.
pub fn delta_companions(base_alias: &str, group_aliases: &[String]) -> Vec<MetricDefinition> {
    let partition = if group_aliases.is_empty() {
        String::new()
    } else {
        format!("PARTITION BY {} ", group_aliases.join(", "))
    };
    let window = format!(
        "({partition}ORDER BY {TIME_BUCKET_ALIAS} ASC ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING)"
    );

    let previous = format!("previous_{base_alias}");
    let delta = format!("{base_alias}_delta");
    let percent = format!("{base_alias}_percent_change");

    vec![
        MetricDefinition {
            alias: previous.clone(),
            select_clause: format!("lagInFrame({base_alias}, 1, {base_alias}) OVER {window} AS {previous}"),
            required_tables: vec![],
            cte: None,
            trend_base: false,
            top_k: None,
        },
        MetricDefinition {
            alias: delta.clone(),
            select_clause: format!("round({base_alias} - {previous}, 2) AS {delta}"),
            required_tables: vec![],
            cte: None,
            trend_base: false,
            top_k: None,
        },
        MetricDefinition {
            alias: percent.clone(),
            select_clause: format!("round(({base_alias} - {previous}) / {previous} * 100, 2) AS {percent}"),
            required_tables: vec![],
            cte: None,
            trend_base: false,
            top_k: None,
        },
    ]
}
