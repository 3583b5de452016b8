//! Engine configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set via the
//! `-f` flag or the `INFERSCOPE_CONFIG` environment variable.
//!
//! ## Loading priority
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. **YAML config file** - base configuration (default: `config.yaml`)
//! 2. **Environment variables** - `INFERSCOPE_`-prefixed variables; nested
//!    fields use double underscores (`INFERSCOPE_POOL__MAX_CONNECTIONS=16`)
//! 3. **CLICKHOUSE_URL** - special case overriding `store.url`
//!
//! ## Configuration structure
//!
//! ```yaml
//! store:
//!   url: http://localhost:8123
//!   database: telemetry
//!   user: default
//! pool:
//!   min_connections: 2
//!   max_connections: 10
//!   connect_timeout: 5s
//!   warmup: true
//! query:
//!   max_concurrent: 8
//! cache:
//!   enabled: true
//!   max_entries: 1000
//!   ttl: 60s
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "INFERSCOPE_CONFIG", default_value = "config.yaml")]
    pub config: String,
}

/// Root engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Store connection settings
    pub store: StoreConfig,
    /// Connection pool sizing
    pub pool: PoolConfig,
    /// Query execution limits
    pub query: QueryConfig,
    /// Result cache settings
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            pool: PoolConfig::default(),
            query: QueryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// ClickHouse HTTP interface connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Base URL of the store's HTTP interface
    pub url: Url,
    /// Database holding the telemetry tables
    pub database: String,
    /// Store user
    pub user: String,
    /// Store password (prefer setting via INFERSCOPE_STORE__PASSWORD)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://localhost:8123").expect("valid default url"),
            database: "telemetry".to_string(),
            user: "default".to_string(),
            password: None,
        }
    }
}

/// Connection pool sizing and warm-up behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections established (and optionally warmed) at startup
    pub min_connections: usize,
    /// Hard cap on pooled connections
    pub max_connections: usize,
    /// Timeout for establishing a new connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Run a trivial query on each startup connection to prime it
    pub warmup: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            warmup: true,
        }
    }
}

/// Query execution limits. `max_concurrent` is the binding concurrency cap,
/// independent of pool size: excess queries queue rather than being
/// rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    /// Maximum simultaneously in-flight store queries
    pub max_concurrent: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

/// Result cache bounds. Entries are evicted by capacity (least recently
/// used) and by age (`ttl`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum cached (query, params) entries
    pub max_entries: u64,
    /// Time-to-live for a cached entry
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from the file named by `args` plus environment
    /// overrides, then validate it.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("INFERSCOPE_").split("__"))
            // Common deployment pattern: a bare CLICKHOUSE_URL env var
            .merge(Env::raw().only(&["CLICKHOUSE_URL"]).map(|_| "store.url".into()).split("."))
    }

    /// Validate cross-field invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.max_connections == 0 {
            return Err("pool.max_connections must be greater than 0".to_string());
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(format!(
                "pool.min_connections ({}) cannot exceed pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            ));
        }
        if self.query.max_concurrent == 0 {
            return Err("query.max_concurrent must be greater than 0".to_string());
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err("cache.max_entries must be greater than 0 when the cache is enabled".to_string());
        }
        if self.store.database.is_empty() {
            return Err("store.database cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.query.max_concurrent, 8);
        assert!(config.cache.enabled);
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = Config::default();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_min_above_max() {
        let mut config = Config::default();
        config.pool.min_connections = 20;
        assert!(config.validate().unwrap_err().contains("min_connections"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = Config::default();
        config.query.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_yaml_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
store:
  url: http://clickhouse.internal:8123
  database: inference
pool:
  min_connections: 1
  max_connections: 4
  connect_timeout: 2s
cache:
  ttl: 30s
"#,
            )?;

            jail.set_env("INFERSCOPE_QUERY__MAX_CONCURRENT", "3");

            let args = Args {
                config: "test.yaml".to_string(),
            };
            let config = Config::load(&args)?;

            assert_eq!(config.store.url.as_str(), "http://clickhouse.internal:8123/");
            assert_eq!(config.store.database, "inference");
            assert_eq!(config.pool.max_connections, 4);
            assert_eq!(config.pool.connect_timeout, Duration::from_secs(2));
            assert_eq!(config.cache.ttl, Duration::from_secs(30));
            // Env var should override
            assert_eq!(config.query.max_concurrent, 3);

            Ok(())
        });
    }

    #[test]
    fn clickhouse_url_env_overrides_store_url() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "store:\n  database: telemetry\n")?;
            jail.set_env("CLICKHOUSE_URL", "http://ch.prod.internal:8123");

            let args = Args {
                config: "test.yaml".to_string(),
            };
            let config = Config::load(&args)?;
            assert_eq!(config.store.url.as_str(), "http://ch.prod.internal:8123/");
            Ok(())
        });
    }
}
