//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::entitlement::{CacheOptions, HttpPolicySource, PersistenceBackend, Platform, PolicyCache};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{FailureMode, LimitTable, StoreBackend};

/// Prefix for environment overrides, e.g. `GATEKEEPER__ENTITLEMENT__ENDPOINT`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Entitlement policy configuration
    #[serde(default)]
    pub entitlement: EntitlementConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// What to do when the counter store fails
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Counter store implementation
    #[serde(default)]
    pub store: StoreBackend,

    /// Expired counter sweep interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Path to a YAML limit table layered over the built-in rules
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            store: StoreBackend::default(),
            cleanup_interval_secs: default_cleanup_interval(),
            rules_path: None,
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Sweep interval as a duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// The built-in limit table with any configured overrides applied.
    pub fn limit_table(&self) -> Result<LimitTable> {
        let builtin = LimitTable::builtin();
        match &self.rules_path {
            Some(path) => Ok(builtin.merged(LimitTable::from_file(path)?)),
            None => Ok(builtin),
        }
    }
}

/// Entitlement policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementConfig {
    /// Policy service URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Platform the policy is requested for
    #[serde(default)]
    pub platform: Platform,

    /// Bearer token for user-specific policies
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Upper bound on one policy fetch in milliseconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// How long a fetched policy is served without refetching, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// After a failed fetch, seconds to keep serving the fallback before retrying
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Where fetched policies are persisted
    #[serde(default)]
    pub persistence: PersistenceBackend,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            platform: Platform::default(),
            auth_token: None,
            fetch_timeout_ms: default_fetch_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            retry_backoff_secs: default_retry_backoff(),
            persistence: PersistenceBackend::default(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3000/api/v1/config/paywall-strategy".to_string()
}

fn default_fetch_timeout() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_retry_backoff() -> u64 {
    30
}

impl EntitlementConfig {
    /// Cache tunables derived from this section.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            platform: self.platform,
            ttl: Duration::from_secs(self.cache_ttl_secs),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    /// Build the policy cache this section describes.
    pub fn policy_cache(&self) -> Result<PolicyCache> {
        let source = HttpPolicySource::new(&self.endpoint)?.with_auth_token(self.auth_token.clone());
        Ok(PolicyCache::new(
            Arc::new(source),
            self.persistence.build(),
            self.cache_options(),
        ))
    }
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatekeeperConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional YAML file, then `GATEKEEPER__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.cleanup_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if self.entitlement.fetch_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "entitlement.fetch_timeout_ms must be positive".to_string(),
            ));
        }
        if self.entitlement.cache_ttl_secs == 0 {
            return Err(GatekeeperError::Config(
                "entitlement.cache_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
