//! Common table expression definitions and rendering.
//!
//! CTEs are rendered from a typed [`CteRenderContext`] rather than string
//! templates with positional placeholders: each CTE kind has one explicit
//! render function, so a missing or misnamed substitution is a compile
//! error, not a malformed query.

/// The closed set of CTE kinds the planner can attach to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CteKind {
    /// Per-arrival-timestamp overlap counts for the concurrent_requests
    /// metric. Joined with LEFT JOIN so buckets without overlap still
    /// produce a row (COALESCE'd to zero) instead of being dropped.
    Concurrency,
}

impl CteKind {
    /// Name the CTE is registered and joined under.
    pub fn name(&self) -> &'static str {
        match self {
            CteKind::Concurrency => "request_concurrency",
        }
    }

    /// Join alias used in the main query.
    pub fn alias(&self) -> &'static str {
        match self {
            CteKind::Concurrency => "cr",
        }
    }
}

/// Request-specific fragments substituted into a CTE body. All members are
/// built by the planner from allowlisted identifiers and bind-parameter
/// placeholders only.
#[derive(Debug)]
pub struct CteRenderContext<'a> {
    /// Full filter clause: date-range bounds plus any dimension conditions.
    pub where_clause: &'a str,
    /// Aliased dimension selects, e.g. `d.model_id AS model_id`.
    pub group_selects: &'a [String],
    /// Output aliases of the grouping dimensions, e.g. `model_id`.
    pub group_aliases: &'a [String],
}

impl CteKind {
    /// Render `name AS (body)` for the WITH list.
    pub fn render(&self, ctx: &CteRenderContext<'_>) -> String {
        match self {
            CteKind::Concurrency => render_concurrency(ctx),
        }
    }
}

/// Overlap counts grouped by the exact arrival timestamp plus the request's
/// grouping dimensions. Timestamps with a single request are excluded; the
/// main query restores them as zero via LEFT JOIN + COALESCE.
fn render_concurrency(ctx: &CteRenderContext<'_>) -> String {
    let mut select_cols = vec!["d.request_arrival_time AS arrival_ts".to_string()];
    select_cols.extend(ctx.group_selects.iter().cloned());

    let mut group_cols = vec!["arrival_ts".to_string()];
    group_cols.extend(ctx.group_aliases.iter().cloned());

    format!(
        "request_concurrency AS (SELECT {selects}, COUNT(*) AS concurrent_count \
         FROM inference_details d \
         WHERE {where_clause} \
         GROUP BY {groups} \
         HAVING COUNT(*) > 1)",
        selects = select_cols.join(", "),
        where_clause = ctx.where_clause,
        groups = group_cols.join(", "),
    )
}

/// Ranking body for top-k over concurrent_requests. The rank value is an
/// aggregate over the per-timestamp sub-aggregate: the average of each
/// group's overlap maxima across the window.
pub fn render_concurrency_ranking(ctx: &CteRenderContext<'_>, limit: u32) -> String {
    let mut inner_selects = vec!["d.request_arrival_time AS arrival_ts".to_string()];
    inner_selects.extend(ctx.group_selects.iter().cloned());

    let mut inner_groups = vec!["arrival_ts".to_string()];
    inner_groups.extend(ctx.group_aliases.iter().cloned());

    let aliases = ctx.group_aliases.join(", ");

    format!(
        "top_groups AS (SELECT {aliases} FROM \
         (SELECT {inner_selects}, COUNT(*) AS concurrent_count \
         FROM inference_details d \
         WHERE {where_clause} \
         GROUP BY {inner_groups} \
         HAVING COUNT(*) > 1) \
         GROUP BY {aliases} \
         ORDER BY avg(concurrent_count) DESC \
         LIMIT {limit})",
        aliases = aliases,
        inner_selects = inner_selects.join(", "),
        where_clause = ctx.where_clause,
        inner_groups = inner_groups.join(", "),
        limit = limit,
    )
}
