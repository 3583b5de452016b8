//! Identifier allowlist and value quoting.
//!
//! Every dynamic fragment of generated SQL is assembled from the fixed
//! tables in this module; caller strings are resolved to closed enums here
//! and never spliced into SQL as identifiers. Filter *values* (UUIDs) are
//! emitted exclusively through [`quote_uuid`]. This allowlist-plus-single-
//! escaping-point design is the engine's injection-safety invariant.

use uuid::Uuid;

use crate::errors::PlanningError;
use crate::types::{FilterKey, GroupKey, MetricName};

/// Qualified column for a filter dimension.
pub fn filter_column(key: FilterKey) -> &'static str {
    match key {
        FilterKey::Model => "d.model_id",
        FilterKey::Project => "d.project_id",
        FilterKey::Endpoint => "d.endpoint_id",
        FilterKey::UserProject => "d.user_project_id",
    }
}

/// Qualified column for a grouping dimension.
pub fn group_column(key: GroupKey) -> &'static str {
    match key {
        GroupKey::Model => "d.model_id",
        GroupKey::Project => "d.project_id",
        GroupKey::Endpoint => "d.endpoint_id",
        GroupKey::UserProject => "d.user_project_id",
    }
}

/// Resolve a caller-supplied metric name against the registry.
pub fn parse_metric(name: &str) -> Result<MetricName, PlanningError> {
    name.parse().map_err(|name| PlanningError::UnsupportedMetric { name })
}

/// Resolve a caller-supplied filter key against the allowlist.
pub fn parse_filter_key(name: &str) -> Result<FilterKey, PlanningError> {
    name.parse().map_err(|key| PlanningError::UnsupportedFilterKey { key })
}

/// Resolve a caller-supplied group key against the allowlist.
pub fn parse_group_key(name: &str) -> Result<GroupKey, PlanningError> {
    name.parse().map_err(|key| PlanningError::UnsupportedGroupKey { key })
}

/// Quote a filter value for SQL. The centralized quoting point for every
/// value-position literal the planner emits: values arrive as parsed
/// [`Uuid`]s, so the rendered form is the canonical hyphenated-hex
/// representation inside single quotes and can never carry quote or escape
/// characters.
pub fn quote_uuid(value: &Uuid) -> String {
    format!("'{}'", value.as_hyphenated())
}

/// Validate a table or column identifier for the insert path. ClickHouse
/// identifiers used by this crate are lowercase alphanumeric with
/// underscores; anything else is rejected before reaching the store.
pub fn validate_identifier(ident: &str) -> Result<(), String> {
    let valid = !ident.is_empty()
        && ident.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid { Ok(()) } else { Err(ident.to_string()) }
}
