//! Service configuration.
//!
//! Loaded from a YAML file (default `config/gridpoint.yaml`). Every field has
//! a default so a partial file, or no file at all, is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::resolver::RetryPolicy;
use crate::throttle::ThrottleConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Remote points endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Contact domain for the User-Agent header.
    #[serde(default)]
    pub ua_domain: String,
    /// Contact email for the User-Agent header.
    #[serde(default)]
    pub ua_email: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts per cell, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_base_url() -> String {
    "https://api.weather.gov".to_string()
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ua_domain: String::new(),
            ua_email: String::new(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ApiConfig {
    /// `(domain, email)`, the form the authority asks clients to send.
    pub fn user_agent(&self) -> String {
        format!("({}, {})", self.ua_domain, self.ua_email)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// Checks needed before any remote call is made.
    pub fn validate(&self) -> Result<()> {
        if self.ua_domain.trim().is_empty() || self.ua_email.trim().is_empty() {
            bail!("api.ua_domain and api.ua_email must be set (or UA_DOMAIN / UA_EMAIL)");
        }
        if self.max_attempts == 0 {
            bail!("api.max_attempts must be at least 1");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            bail!("api.base_url must be an http(s) URL, got {:?}", self.base_url);
        }
        Ok(())
    }
}

/// Refresh run tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Worker pool size; also the throttle's ceiling.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Floor for rate-limit driven concurrency reduction.
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    /// Shared call budget per second; 0 disables pacing.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Consecutive successes needed to restore one permit.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    /// Failure ratio at or above which a run is `failed` rather than
    /// `partially_failed`.
    #[serde(default = "default_systemic_failure_ratio")]
    pub systemic_failure_ratio: f64,
    /// Start a targeted retry run right after a partially failed run.
    #[serde(default)]
    pub retry_failed_immediately: bool,
    /// Log and checkpoint progress every N cells.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

fn default_pool_size() -> usize {
    16
}
fn default_min_concurrency() -> usize {
    1
}
fn default_requests_per_second() -> f64 {
    20.0
}
fn default_recovery_successes() -> u32 {
    50
}
fn default_systemic_failure_ratio() -> f64 {
    0.5
}
fn default_progress_every() -> u64 {
    1000
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            min_concurrency: default_min_concurrency(),
            requests_per_second: default_requests_per_second(),
            recovery_successes: default_recovery_successes(),
            systemic_failure_ratio: default_systemic_failure_ratio(),
            retry_failed_immediately: false,
            progress_every: default_progress_every(),
        }
    }
}

impl RefreshConfig {
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrency: self.pool_size,
            min_concurrency: self.min_concurrency,
            recovery_successes: self.recovery_successes,
            requests_per_second: self.requests_per_second,
        }
    }
}

/// On-demand resolution for lookups that miss the table.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,
    #[serde(default = "default_fallback_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_fallback_rps")]
    pub requests_per_second: f64,
}

fn default_fallback_enabled() -> bool {
    true
}
fn default_fallback_concurrency() -> usize {
    2
}
fn default_fallback_rps() -> f64 {
    2.0
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            max_concurrency: default_fallback_concurrency(),
            requests_per_second: default_fallback_rps(),
        }
    }
}

impl FallbackConfig {
    /// A small budget for live calls. A 429 halves it like any other
    /// throttle; successes earn it back.
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrency: self.max_concurrency,
            min_concurrency: 1,
            recovery_successes: 10,
            requests_per_second: self.requests_per_second,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_edge_m")]
    pub edge_m: f64,
    /// Region boundary GeoJSON used when `partition` is run without
    /// `--region`.
    #[serde(default)]
    pub region_path: Option<PathBuf>,
}

fn default_edge_m() -> f64 {
    partition::DEFAULT_EDGE_M
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            edge_m: default_edge_m(),
            region_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/gridpoints.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// In-process refresh timer; unset means refreshes are triggered
    /// externally.
    #[serde(default)]
    pub refresh_every_hours: Option<u64>,
    /// How often to check for a newer partition; 0 disables reloading.
    #[serde(default = "default_index_reload_secs")]
    pub index_reload_secs: u64,
}

fn default_index_reload_secs() -> u64 {
    60
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            refresh_every_hours: None,
            index_reload_secs: default_index_reload_secs(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Load the file if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill User-Agent contact details from `UA_DOMAIN` / `UA_EMAIL` when set.
    pub fn apply_env(&mut self) {
        if let Ok(domain) = std::env::var("UA_DOMAIN") {
            if !domain.trim().is_empty() {
                self.api.ua_domain = domain;
            }
        }
        if let Ok(email) = std::env::var("UA_EMAIL") {
            if !email.trim().is_empty() {
                self.api.ua_email = email;
            }
        }
    }

    /// Structural checks that do not depend on remote credentials.
    pub fn validate(&self) -> Result<()> {
        let refresh = &self.refresh;
        if refresh.pool_size == 0 {
            bail!("refresh.pool_size must be at least 1");
        }
        if refresh.min_concurrency == 0 || refresh.min_concurrency > refresh.pool_size {
            bail!(
                "refresh.min_concurrency must be between 1 and pool_size ({})",
                refresh.pool_size
            );
        }
        if !(refresh.systemic_failure_ratio > 0.0 && refresh.systemic_failure_ratio <= 1.0) {
            bail!(
                "refresh.systemic_failure_ratio must be in (0, 1], got {}",
                refresh.systemic_failure_ratio
            );
        }
        if !(refresh.requests_per_second >= 0.0 && refresh.requests_per_second.is_finite()) {
            bail!("refresh.requests_per_second must be >= 0");
        }
        if self.fallback.max_concurrency == 0 {
            bail!("fallback.max_concurrency must be at least 1");
        }
        if !(self.partition.edge_m.is_finite() && self.partition.edge_m > 0.0) {
            bail!("partition.edge_m must be positive, got {}", self.partition.edge_m);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServiceConfig::from_yaml("{}").unwrap();
        assert_eq!(config.api.base_url, "https://api.weather.gov");
        assert_eq!(config.refresh.pool_size, 16);
        assert_eq!(config.partition.edge_m, 2500.0);
        assert!(!config.refresh.retry_failed_immediately);
        assert!(config.server.refresh_every_hours.is_none());
        assert_eq!(config.server.index_reload_secs, 60);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
api:
  base_url: "http://localhost:9000"
  ua_domain: example.org
  ua_email: ops@example.org
  max_attempts: 3

refresh:
  pool_size: 8
  min_concurrency: 2
  systemic_failure_ratio: 0.25
  retry_failed_immediately: true

storage:
  database_path: /var/lib/gridpoint/gridpoints.db

server:
  listen: "127.0.0.1:9100"
  refresh_every_hours: 24
  index_reload_secs: 0
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.api.user_agent(), "(example.org, ops@example.org)");
        assert_eq!(config.api.retry_policy().max_attempts, 3);
        assert_eq!(config.refresh.throttle().max_concurrency, 8);
        assert_eq!(config.refresh.throttle().min_concurrency, 2);
        assert!(config.refresh.retry_failed_immediately);
        assert_eq!(config.server.refresh_every_hours, Some(24));
        assert_eq!(config.server.index_reload_secs, 0);
        assert!(config.api.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let err = ServiceConfig::from_yaml("refresh:\n  systemic_failure_ratio: 1.5\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_min_above_pool() {
        let err = ServiceConfig::from_yaml("refresh:\n  pool_size: 2\n  min_concurrency: 4\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_api_requires_contact() {
        assert!(ApiConfig::default().validate().is_err());
    }
}
