//! The query planner: turns a declarative [`MetricsQuery`] into one
//! parameterized ClickHouse statement plus the ordered list of output
//! column aliases.
//!
//! Planning is synchronous and touches no I/O. Every identifier in the
//! generated SQL comes from the allowlist in [`escape`]; the only bind
//! parameters are the date-range bounds, carried as ClickHouse `{name:type}`
//! placeholders and shipped alongside the SQL in [`PlannedQuery::params`].
//!
//! The returned `field_order` is the column contract the result processor
//! relies on; it lists the selected aliases in SELECT order and nothing
//! else may be assumed about row shape.

pub mod cte;
pub mod escape;
pub mod metrics;
pub mod time_series;

use std::collections::BTreeMap;

use chrono::Utc;

use crate::errors::PlanningError;
use crate::types::{FilterValue, MetricsQuery};

use cte::{CteKind, CteRenderContext};
use metrics::{MetricDefinition, Table, TopKSource};
use time_series::TIME_BUCKET_ALIAS;

/// Bind-parameter placeholder for the window start.
pub const FROM_DATE_PARAM: &str = "{from_date:DateTime64(3)}";
/// Bind-parameter placeholder for the window end.
pub const TO_DATE_PARAM: &str = "{to_date:DateTime64(3)}";

/// Qualified arrival-time column every window predicate uses.
const TIME_COLUMN: &str = "d.request_arrival_time";

/// Format used for the date bind-parameter values.
const DATE_PARAM_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A planned statement ready for execution.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub sql: String,
    /// Selected output aliases in SELECT order. The only column contract
    /// the result processor may rely on.
    pub field_order: Vec<String>,
    /// Bind parameters (date-range bounds only), keyed by parameter name.
    pub params: BTreeMap<String, String>,
}

/// Plan a metrics query. Fails before producing any SQL when the request
/// references anything outside the closed registries or carries an empty
/// filter list.
pub fn build(query: &MetricsQuery) -> Result<PlannedQuery, PlanningError> {
    // Reject empty filter lists up front: `IN ()` must never reach the store.
    for (key, value) in &query.filters {
        if value.is_empty() {
            return Err(PlanningError::EmptyFilterValue { key: key.to_string() });
        }
    }

    let frequency = query.frequency();
    let to_date = query.to_date.unwrap_or_else(Utc::now);

    // Grouping dimensions, in request order.
    let group_selects: Vec<String> = query
        .group_by
        .iter()
        .map(|key| format!("{} AS {}", escape::group_column(*key), key.alias()))
        .collect();
    let group_aliases: Vec<String> = query.group_by.iter().map(|key| key.alias().to_string()).collect();

    // Metric definitions plus trend companions, and the CTEs they register.
    let mut definitions: Vec<MetricDefinition> = Vec::new();
    let mut ctes: Vec<CteKind> = Vec::new();
    for metric in &query.metrics {
        let defs = metrics::definitions_for(*metric);
        for def in &defs {
            if let Some(kind) = def.cte
                && !ctes.contains(&kind)
            {
                ctes.push(kind);
            }
        }
        let trend_alias = defs.iter().find(|d| d.trend_base).map(|d| d.alias.clone());
        definitions.extend(defs);
        if query.return_delta
            && let Some(alias) = trend_alias
        {
            definitions.extend(metrics::delta_companions(&alias, &group_aliases));
        }
    }

    let where_clause = build_where_clause(query)?;

    // Union of base tables across all definitions.
    let needs_metrics_table = definitions
        .iter()
        .any(|d| d.required_tables.contains(&Table::Metrics));

    // WITH list: registered metric CTEs, then the ranking CTE.
    let ctx = CteRenderContext {
        where_clause: &where_clause,
        group_selects: &group_selects,
        group_aliases: &group_aliases,
    };
    let mut with_items: Vec<String> = ctes.iter().map(|kind| kind.render(&ctx)).collect();
    if let Some(k) = query.top_k {
        with_items.push(build_ranking_cte(query, &ctx, k)?);
    }

    // SELECT list and the field-order contract.
    let bucket_expr = time_series::bucket_expression(&frequency, TIME_COLUMN);
    let mut select_items = vec![format!("{bucket_expr} AS {TIME_BUCKET_ALIAS}")];
    select_items.extend(group_selects.iter().cloned());
    select_items.extend(definitions.iter().map(|d| d.select_clause.clone()));

    let mut field_order = vec![TIME_BUCKET_ALIAS.to_string()];
    field_order.extend(group_aliases.iter().cloned());
    field_order.extend(definitions.iter().map(|d| d.alias.clone()));

    // FROM and joins. The details table anchors; the metrics table joins on
    // the shared request id; the concurrency CTE LEFT JOINs so zero-overlap
    // buckets keep their rows.
    let mut from_clause = format!("FROM {} {}", Table::Details.sql_name(), Table::Details.alias());
    if needs_metrics_table {
        from_clause.push_str(&format!(
            " INNER JOIN {table} {alias} ON {alias}.request_id = d.request_id",
            table = Table::Metrics.sql_name(),
            alias = Table::Metrics.alias(),
        ));
    }
    for kind in &ctes {
        let mut on_parts = vec![format!("{}.arrival_ts = {}", kind.alias(), TIME_COLUMN)];
        for key in &query.group_by {
            on_parts.push(format!("{}.{} = {}", kind.alias(), key.alias(), escape::group_column(*key)));
        }
        from_clause.push_str(&format!(" LEFT JOIN {} {} ON {}", kind.name(), kind.alias(), on_parts.join(" AND ")));
    }
    if query.top_k.is_some() {
        let on_parts: Vec<String> = query
            .group_by
            .iter()
            .map(|key| format!("tg.{} = {}", key.alias(), escape::group_column(*key)))
            .collect();
        from_clause.push_str(&format!(" INNER JOIN top_groups tg ON {}", on_parts.join(" AND ")));
    }

    // GROUP BY and ORDER BY over the output aliases.
    let mut group_by = vec![TIME_BUCKET_ALIAS.to_string()];
    group_by.extend(group_aliases.iter().cloned());

    let mut order_by = format!("ORDER BY {TIME_BUCKET_ALIAS} DESC");
    if query.fill_time_gaps {
        order_by.push_str(&format!(" WITH FILL STEP {}", time_series::fill_step_literal(&frequency)));
    }

    let with_clause = if with_items.is_empty() {
        String::new()
    } else {
        format!("WITH {} ", with_items.join(", "))
    };

    let sql = format!(
        "{with_clause}SELECT {selects} {from_clause} WHERE {where_clause} GROUP BY {group_by} {order_by}",
        with_clause = with_clause,
        selects = select_items.join(", "),
        from_clause = from_clause,
        where_clause = where_clause,
        group_by = group_by.join(", "),
        order_by = order_by,
    );

    let mut params = BTreeMap::new();
    params.insert(
        "from_date".to_string(),
        query.from_date.naive_utc().format(DATE_PARAM_FORMAT).to_string(),
    );
    params.insert("to_date".to_string(), to_date.naive_utc().format(DATE_PARAM_FORMAT).to_string());

    Ok(PlannedQuery {
        sql,
        field_order,
        params,
    })
}

/// Date-range bounds (always present, inclusive on both ends) plus one
/// condition per filter key. Filters iterate in key order so identical
/// requests produce identical SQL (and identical cache keys).
fn build_where_clause(query: &MetricsQuery) -> Result<String, PlanningError> {
    let mut conditions = vec![format!(
        "{TIME_COLUMN} BETWEEN {FROM_DATE_PARAM} AND {TO_DATE_PARAM}"
    )];

    let mut filters: Vec<_> = query.filters.iter().collect();
    filters.sort_by_key(|(key, _)| key.as_str());

    for (key, value) in filters {
        let column = escape::filter_column(*key);
        let condition = match value {
            FilterValue::One(id) => format!("{column} = {}", escape::quote_uuid(id)),
            FilterValue::Many(ids) if ids.len() == 1 => {
                format!("{column} = {}", escape::quote_uuid(&ids[0]))
            }
            FilterValue::Many(ids) => {
                let quoted: Vec<String> = ids.iter().map(escape::quote_uuid).collect();
                format!("{column} IN ({})", quoted.join(", "))
            }
        };
        conditions.push(condition);
    }

    Ok(conditions.join(" AND "))
}

/// Ranking CTE for top-k: scores groups by the first requested metric, in
/// that metric's own "better" direction, and keeps the best K.
fn build_ranking_cte(query: &MetricsQuery, ctx: &CteRenderContext<'_>, k: u32) -> Result<String, PlanningError> {
    // Upstream validation guarantees group_by is non-empty here; the
    // ranking metric is the first requested one.
    let Some(metric) = query.metrics.first().copied() else {
        return Err(PlanningError::UnsupportedMetric { name: String::new() });
    };
    let defs = metrics::definitions_for(metric);
    let ranked = defs
        .iter()
        .find_map(|d| d.top_k.clone().map(|src| (src, d.required_tables.clone())));

    let Some((source, required_tables)) = ranked else {
        // Every registered metric carries a ranking source; reaching this
        // arm means the registry lost one.
        return Err(PlanningError::UnsupportedMetric {
            name: metric.to_string(),
        });
    };

    match source {
        TopKSource::ConcurrencyAverage => Ok(cte::render_concurrency_ranking(ctx, k)),
        TopKSource::Expression(expr) => {
            let direction = if metric.lower_is_better() { "ASC" } else { "DESC" };
            let mut from_clause = format!("FROM {} {}", Table::Details.sql_name(), Table::Details.alias());
            if required_tables.contains(&Table::Metrics) {
                from_clause.push_str(&format!(
                    " INNER JOIN {table} {alias} ON {alias}.request_id = d.request_id",
                    table = Table::Metrics.sql_name(),
                    alias = Table::Metrics.alias(),
                ));
            }
            Ok(format!(
                "top_groups AS (SELECT {selects} {from_clause} WHERE {where_clause} \
                 GROUP BY {aliases} ORDER BY {expr} {direction} LIMIT {k})",
                selects = ctx.group_selects.join(", "),
                from_clause = from_clause,
                where_clause = ctx.where_clause,
                aliases = ctx.group_aliases.join(", "),
                expr = expr,
                direction = direction,
                k = k,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilterKey, FrequencyUnit, GroupKey, MetricName};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn base_query(metrics: Vec<MetricName>) -> MetricsQuery {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut query = MetricsQuery::new(metrics, from, FrequencyUnit::Hour);
        query.to_date = Some(Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap());
        query
    }

    #[test]
    fn every_metric_plans_with_matching_field_order() {
        for metric in MetricName::ALL {
            let planned = build(&base_query(vec![metric])).unwrap();
            assert_eq!(planned.field_order[0], "time_bucket");
            for alias in &planned.field_order {
                assert!(
                    planned.sql.contains(&format!("AS {alias}")),
                    "alias {alias} missing from SQL for {metric}: {}",
                    planned.sql
                );
            }
            // No alias drift: each selected alias appears exactly once.
            for def in metrics::definitions_for(metric) {
                assert!(planned.field_order.contains(&def.alias));
            }
        }
    }

    #[test]
    fn hourly_native_bucketing() {
        let planned = build(&base_query(vec![MetricName::RequestCount])).unwrap();
        assert!(planned.sql.contains("toStartOfHour(d.request_arrival_time) AS time_bucket"));
        assert!(planned.sql.contains("BETWEEN {from_date:DateTime64(3)} AND {to_date:DateTime64(3)}"));
        assert_eq!(planned.params.get("from_date").unwrap(), "2024-01-01 00:00:00.000");
        assert_eq!(planned.params.get("to_date").unwrap(), "2024-01-08 00:00:00.000");
    }

    #[test]
    fn custom_interval_bucketing_aligns_to_from_date() {
        let mut query = base_query(vec![MetricName::RequestCount]);
        query.frequency_interval = Some(6);
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains("intDiv("));
        assert!(planned.sql.contains("21600"));
        assert!(!planned.sql.contains("toStartOfHour"));
    }

    #[test]
    fn empty_filter_list_fails_before_sql() {
        let mut query = base_query(vec![MetricName::RequestCount]);
        query.filters.insert(FilterKey::Project, FilterValue::Many(vec![]));
        let err = build(&query).unwrap_err();
        assert_eq!(
            err,
            PlanningError::EmptyFilterValue {
                key: "project".to_string()
            }
        );
    }

    #[test]
    fn filters_render_through_the_allowlist() {
        let project = Uuid::new_v4();
        let models = vec![Uuid::new_v4(), Uuid::new_v4()];

        let mut query = base_query(vec![MetricName::RequestCount]);
        query.filters.insert(FilterKey::Project, FilterValue::One(project));
        query
            .filters
            .insert(FilterKey::Model, FilterValue::Many(models.clone()));

        let planned = build(&query).unwrap();
        assert!(planned.sql.contains(&format!("d.project_id = '{project}'")));
        assert!(planned
            .sql
            .contains(&format!("d.model_id IN ('{}', '{}')", models[0], models[1])));
        // Never an empty IN
        assert!(!planned.sql.contains("IN ()"));
    }

    #[test]
    fn single_element_list_renders_as_equality() {
        let id = Uuid::new_v4();
        let mut query = base_query(vec![MetricName::RequestCount]);
        query.filters.insert(FilterKey::Endpoint, FilterValue::Many(vec![id]));
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains(&format!("d.endpoint_id = '{id}'")));
    }

    #[test]
    fn grouping_adds_dimensions_to_select_group_and_field_order() {
        let mut query = base_query(vec![MetricName::Latency]);
        query.group_by = vec![GroupKey::Project, GroupKey::Model];
        let planned = build(&query).unwrap();

        assert!(planned.sql.contains("d.project_id AS project_id"));
        assert!(planned.sql.contains("d.model_id AS model_id"));
        assert!(planned.sql.contains("GROUP BY time_bucket, project_id, model_id"));
        assert_eq!(planned.field_order[..3], ["time_bucket", "project_id", "model_id"]);
    }

    #[test]
    fn order_is_descending_with_optional_fill() {
        let planned = build(&base_query(vec![MetricName::RequestCount])).unwrap();
        assert!(planned.sql.contains("ORDER BY time_bucket DESC"));
        assert!(!planned.sql.contains("WITH FILL"));

        let mut query = base_query(vec![MetricName::RequestCount]);
        query.fill_time_gaps = true;
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains("ORDER BY time_bucket DESC WITH FILL STEP INTERVAL -1 HOUR"));
    }

    #[test]
    fn return_delta_appends_companions_in_field_order() {
        let mut query = base_query(vec![MetricName::RequestCount]);
        query.return_delta = true;
        let planned = build(&query).unwrap();

        assert_eq!(
            planned.field_order,
            vec![
                "time_bucket",
                "request_count",
                "previous_request_count",
                "request_count_delta",
                "request_count_percent_change",
            ]
        );
        assert!(planned.sql.contains("lagInFrame(request_count, 1, request_count) OVER"));
        assert!(planned.sql.contains("ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING"));
    }

    #[test]
    fn grouped_delta_partitions_by_dimensions() {
        let mut query = base_query(vec![MetricName::Latency]);
        query.group_by = vec![GroupKey::Model];
        query.return_delta = true;
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains("PARTITION BY model_id ORDER BY time_bucket ASC"));
    }

    #[test]
    fn concurrency_metric_wires_the_left_joined_cte() {
        let mut query = base_query(vec![MetricName::ConcurrentRequests]);
        query.group_by = vec![GroupKey::Model];
        let planned = build(&query).unwrap();

        assert!(planned.sql.starts_with("WITH request_concurrency AS ("));
        assert!(planned.sql.contains("HAVING COUNT(*) > 1"));
        assert!(planned
            .sql
            .contains("LEFT JOIN request_concurrency cr ON cr.arrival_ts = d.request_arrival_time AND cr.model_id = d.model_id"));
        assert!(planned.sql.contains("COALESCE(MAX(cr.concurrent_count), 0) AS concurrent_requests"));
    }

    #[test]
    fn cte_registration_deduplicates_by_name() {
        let query = base_query(vec![MetricName::ConcurrentRequests, MetricName::ConcurrentRequests]);
        let planned = build(&query).unwrap();
        assert_eq!(planned.sql.matches("request_concurrency AS (").count(), 1);
    }

    #[test]
    fn top_k_ranks_descending_for_counts() {
        let mut query = base_query(vec![MetricName::RequestCount]);
        query.group_by = vec![GroupKey::Project];
        query.top_k = Some(2);
        let planned = build(&query).unwrap();

        assert!(planned.sql.contains("top_groups AS ("));
        assert!(planned.sql.contains("ORDER BY COUNT(d.request_id) DESC LIMIT 2"));
        assert!(planned.sql.contains("INNER JOIN top_groups tg ON tg.project_id = d.project_id"));
    }

    #[test]
    fn top_k_ranks_ascending_for_latency_metrics() {
        let mut query = base_query(vec![MetricName::Ttft]);
        query.group_by = vec![GroupKey::Model];
        query.top_k = Some(3);
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains("ORDER BY avg(f.ttft_ms) ASC LIMIT 3"));
        // The ranking CTE needs the metrics table joined inside it
        let cte_part = planned.sql.split("top_groups AS (").nth(1).unwrap();
        let cte_body = cte_part.split(')').next().unwrap();
        assert!(cte_body.contains("INNER JOIN inference_metrics f"));
    }

    #[test]
    fn top_k_over_concurrency_uses_the_template() {
        let mut query = base_query(vec![MetricName::ConcurrentRequests]);
        query.group_by = vec![GroupKey::Project];
        query.top_k = Some(4);
        let planned = build(&query).unwrap();
        assert!(planned.sql.contains("ORDER BY avg(concurrent_count) DESC"));
        assert!(planned.sql.contains("LIMIT 4"));
    }

    #[test]
    fn metrics_table_joined_only_when_needed() {
        let planned = build(&base_query(vec![MetricName::RequestCount])).unwrap();
        assert!(!planned.sql.contains("INNER JOIN inference_metrics"));

        let planned = build(&base_query(vec![MetricName::Latency])).unwrap();
        assert!(planned.sql.contains("INNER JOIN inference_metrics f ON f.request_id = d.request_id"));
    }

    #[test]
    fn identical_requests_produce_identical_sql() {
        let mut a = base_query(vec![MetricName::RequestCount]);
        a.filters.insert(FilterKey::Model, FilterValue::One(Uuid::nil()));
        a.filters.insert(FilterKey::Project, FilterValue::One(Uuid::nil()));
        let b = a.clone();
        assert_eq!(build(&a).unwrap().sql, build(&b).unwrap().sql);
    }
}
