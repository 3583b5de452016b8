//! Error types for the metrics query engine.
//!
//! Errors are split into two tiers mirroring the request lifecycle:
//!
//! - [`PlanningError`]: the request referenced something outside the
//!   engine's closed registries (metric names, filter/group keys) or carried
//!   an empty filter list. Raised before any SQL text is sent to the store;
//!   always recoverable by the caller fixing the request and never retried
//!   by the engine.
//! - [`StoreError`]: a network, driver, or backend failure while talking to
//!   the store. Transient from the caller's perspective; the whole request
//!   is safe to retry. A failed query returns zero rows, never a truncated
//!   set.
//!
//! Cache failures are not represented here: the cache is best-effort and
//! any cache problem is handled internally as a miss.
//!
//! User-facing messages never contain SQL text or bind parameters. Operator
//! logs may carry a bounded preview produced by [`sql_preview`].

use thiserror::Error as ThisError;

/// Maximum number of characters of SQL retained in operator-facing errors.
const SQL_PREVIEW_LEN: usize = 256;

/// Truncate SQL for operator logs. Full statements never leave the engine
/// through error values.
pub fn sql_preview(sql: &str) -> String {
    if sql.len() <= SQL_PREVIEW_LEN {
        sql.to_string()
    } else {
        let mut end = SQL_PREVIEW_LEN;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &sql[..end])
    }
}

/// Request-shape errors raised by the query planner before any SQL is built.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// Metric name is not in the fixed registry
    #[error("unsupported metric: {name}")]
    UnsupportedMetric { name: String },

    /// Filter key is outside the allowlist
    #[error("unsupported filter key: {key}")]
    UnsupportedFilterKey { key: String },

    /// Group-by key is outside the allowlist
    #[error("unsupported group key: {key}")]
    UnsupportedGroupKey { key: String },

    /// Filter value is an empty list; `IN ()` must never reach the store
    #[error("filter '{key}' has an empty value list")]
    EmptyFilterValue { key: String },
}

/// Execution-layer errors from the store client.
#[derive(ThisError, Debug)]
pub enum StoreError {
    /// Could not establish a connection to the store
    #[error("failed to connect to metrics store: {message}")]
    Connect { message: String },

    /// The store rejected or failed the query. The connection that carried
    /// it has been discarded from the pool.
    #[error("query execution failed")]
    Query {
        message: String,
        sql_preview: String,
    },

    /// A result row could not be decoded
    #[error("failed to decode result row: {message}")]
    Decode { message: String },

    /// The client has been closed; no new work is accepted
    #[error("store client is closed")]
    Closed,

    /// An insert target identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Crate-level error type.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request; fix and resubmit, do not retry as-is
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// Transient execution failure; the whole request may be retried
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns a user-safe message without leaking SQL, parameters, or
    /// internal details. Planning errors name the offending field so the
    /// caller can correct the request.
    pub fn user_message(&self) -> String {
        match self {
            Error::Planning(e) => e.to_string(),
            Error::Store(_) => "query execution failed".to_string(),
            Error::Other(_) => "internal error".to_string(),
        }
    }

    /// Whether retrying the identical request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

/// Type alias for engine operation results
pub type Result<T> = std::result::Result<T, Error>;
