//! Bounded result cache for store queries.
//!
//! Entries are keyed by a hash of the statement text plus its ordered bind
//! parameters and bounded two ways: capacity (least-recently-used eviction)
//! and a time-to-live. The cache is best-effort by contract; it is only
//! consulted and populated by the store client and can never fail a
//! request.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use moka::future::Cache;

use crate::config::CacheConfig;

use super::Row;

/// LRU+TTL cache of `(sql, params) → rows`. Process-local; not shared
/// across instances.
pub struct QueryCache {
    inner: Cache<u64, Arc<Vec<Row>>>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self { inner }
    }

    /// Cache key for a statement and its bind parameters. Params are a
    /// `BTreeMap`, so iteration order (and therefore the key) is stable for
    /// identical requests.
    fn key(sql: &str, params: &BTreeMap<String, String>) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        sql.hash(&mut hasher);
        for (name, value) in params {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub async fn get(&self, sql: &str, params: &BTreeMap<String, String>) -> Option<Arc<Vec<Row>>> {
        self.inner.get(&Self::key(sql, params)).await
    }

    pub async fn insert(&self, sql: &str, params: &BTreeMap<String, String>, rows: Arc<Vec<Row>>) {
        self.inner.insert(Self::key(sql, params), rows).await;
    }

    #[cfg(test)]
    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(max_entries: u64, ttl: Duration) -> QueryCache {
        QueryCache::new(&CacheConfig {
            enabled: true,
            max_entries,
            ttl,
        })
    }

    fn row(value: i64) -> Row {
        let mut map = Row::new();
        map.insert("v".to_string(), serde_json::json!(value));
        map
    }

    #[tokio::test]
    async fn stores_and_returns_rows() {
        let cache = cache(10, Duration::from_secs(60));
        let params = BTreeMap::new();

        assert!(cache.get("SELECT 1", &params).await.is_none());
        cache.insert("SELECT 1", &params, Arc::new(vec![row(1)])).await;

        let hit = cache.get("SELECT 1", &params).await.unwrap();
        assert_eq!(hit.len(), 1);
    }

    #[tokio::test]
    async fn distinct_params_are_distinct_entries() {
        let cache = cache(10, Duration::from_secs(60));
        let mut a = BTreeMap::new();
        a.insert("from_date".to_string(), "2024-01-01 00:00:00.000".to_string());
        let mut b = BTreeMap::new();
        b.insert("from_date".to_string(), "2024-02-01 00:00:00.000".to_string());

        cache.insert("SELECT 1", &a, Arc::new(vec![row(1)])).await;
        assert!(cache.get("SELECT 1", &b).await.is_none());
        assert!(cache.get("SELECT 1", &a).await.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = cache(10, Duration::from_millis(20));
        let params = BTreeMap::new();
        cache.insert("SELECT 1", &params, Arc::new(vec![row(1)])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("SELECT 1", &params).await.is_none());
    }

    #[tokio::test]
    async fn capacity_bounds_the_entry_count() {
        let cache = cache(4, Duration::from_secs(60));
        let params = BTreeMap::new();
        for i in 0..32 {
            cache
                .insert(&format!("SELECT {i}"), &params, Arc::new(vec![row(i)]))
                .await;
        }
        assert!(cache.entry_count().await <= 4);
    }
}
