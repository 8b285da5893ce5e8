//! Gateway configuration container and validation.
//!
//! [`GatewayConfig`] is deserialized by the loader in the parent module and
//! checked with [`GatewayConfig::validate()`] before any listener is bound.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Address and credentials of one downstream datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpointConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl BackendEndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{section}.url cannot be empty")));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "{section}.url must start with http:// or https://, got '{}'",
                self.url
            )));
        }
        Ok(())
    }
}

/// Per-index settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Run queries on this index against both backends and compare results.
    #[serde(default)]
    pub ab_testing: bool,
}

/// Tuning for the A/B-testing dispatch subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestingConfig {
    pub result_queue_capacity: usize,
    pub control_queue_capacity: usize,
    /// Interval of the coordinator's liveness tick and the collector's
    /// health report.
    pub health_check_interval_ms: u64,
    pub collector_queue_capacity: usize,
    pub error_queue_capacity: usize,
    /// Fraction of results kept by the collector, in `[0, 1]`.
    pub sample_ratio: f64,
    /// Index comparison records are written to.
    pub results_index: String,
}

impl Default for AbTestingConfig {
    fn default() -> Self {
        Self {
            result_queue_capacity: 10,
            control_queue_capacity: 10,
            health_check_interval_ms: 10_000,
            collector_queue_capacity: 1000,
            error_queue_capacity: 100,
            sample_ratio: 1.0,
            results_index: "ab_testing_logs".to_string(),
        }
    }
}

impl AbTestingConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Fixed-window rate limit applied per client address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GatewayConfig
// ─────────────────────────────────────────────────────────────────────────────

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address shared by the ingest and query pipelines.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Skip API-key authentication entirely.
    #[serde(default)]
    pub disable_auth: bool,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub elasticsearch: BackendEndpointConfig,
    /// Second cluster that query results are compared against.
    #[serde(default)]
    pub shadow_elasticsearch: Option<BackendEndpointConfig>,
    #[serde(default)]
    pub clickhouse: Option<BackendEndpointConfig>,
    #[serde(default)]
    pub indexes: HashMap<String, IndexConfig>,
    #[serde(default)]
    pub ab_testing: AbTestingConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl GatewayConfig {
    /// Minimal config pointing at one Elasticsearch cluster, auth disabled.
    pub fn new(elasticsearch_url: impl Into<String>) -> Self {
        Self {
            listen: default_listen(),
            disable_auth: true,
            api_keys: Vec::new(),
            elasticsearch: BackendEndpointConfig::new(elasticsearch_url),
            shadow_elasticsearch: None,
            clickhouse: None,
            indexes: HashMap::new(),
            ab_testing: AbTestingConfig::default(),
            rate_limit: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, index: IndexConfig) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }

    pub fn with_api_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.api_keys = keys.into_iter().map(Into::into).collect();
        self.disable_auth = false;
        self
    }

    pub fn with_ab_testing(mut self, ab: AbTestingConfig) -> Self {
        self.ab_testing = ab;
        self
    }

    /// `true` if at least one index enables A/B testing.
    pub fn ab_testing_enabled(&self) -> bool {
        self.indexes.values().any(|i| i.ab_testing)
    }

    /// `true` if A/B testing can run: some index enables it and a shadow
    /// cluster is configured to compare against.
    pub fn ab_testing_active(&self) -> bool {
        self.ab_testing_enabled() && self.shadow_elasticsearch.is_some()
    }

    /// `true` if `index` is configured with A/B testing on.
    pub fn is_ab_tested(&self, index: &str) -> bool {
        self.indexes.get(index).is_some_and(|i| i.ab_testing)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate all structural invariants of this configuration.
    ///
    /// Returns the *first* violation found. Checks performed (in order):
    /// 1. `listen` is non-empty.
    /// 2. Every backend URL is non-empty and uses http(s).
    /// 3. With auth enabled, at least one API key is configured.
    /// 4. No index name is empty.
    /// 5. A/B queue capacities and the health interval are non-zero.
    /// 6. `sample_ratio` lies in `[0, 1]` and `results_index` is non-empty.
    /// 7. A rate limit, if present, has non-zero request count and window.
    /// 8. `shutdown_timeout_ms` is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ── 1. Listen address ───────────────────────────────────────────────
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen cannot be empty".to_string()));
        }

        // ── 2. Backends ─────────────────────────────────────────────────────
        self.elasticsearch.validate("elasticsearch")?;
        if let Some(shadow) = &self.shadow_elasticsearch {
            shadow.validate("shadow_elasticsearch")?;
        }
        if let Some(ch) = &self.clickhouse {
            ch.validate("clickhouse")?;
        }

        // ── 3. Auth ─────────────────────────────────────────────────────────
        if !self.disable_auth && self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "authentication is enabled but no api_keys are configured".to_string(),
            ));
        }

        // ── 4. Indexes ──────────────────────────────────────────────────────
        if self.indexes.keys().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid("index name cannot be empty".to_string()));
        }

        // ── 5. A/B queues ───────────────────────────────────────────────────
        let ab = &self.ab_testing;
        if ab.result_queue_capacity == 0
            || ab.control_queue_capacity == 0
            || ab.collector_queue_capacity == 0
            || ab.error_queue_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "ab_testing queue capacities must be greater than 0".to_string(),
            ));
        }
        if ab.health_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ab_testing.health_check_interval_ms must be greater than 0".to_string(),
            ));
        }

        // ── 6. Sampling / results index ─────────────────────────────────────
        if !(0.0..=1.0).contains(&ab.sample_ratio) {
            return Err(ConfigError::Invalid(format!(
                "ab_testing.sample_ratio must be within [0, 1], got {}",
                ab.sample_ratio
            )));
        }
        if ab.results_index.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ab_testing.results_index cannot be empty".to_string(),
            ));
        }

        // ── 7. Rate limit ───────────────────────────────────────────────────
        if let Some(rl) = &self.rate_limit {
            if rl.max_requests == 0 || rl.window_secs == 0 {
                return Err(ConfigError::Invalid(
                    "rate_limit.max_requests and rate_limit.window_secs must be greater than 0"
                        .to_string(),
                ));
            }
        }

        // ── 8. Shutdown ─────────────────────────────────────────────────────
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
