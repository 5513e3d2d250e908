//! Centralized configuration for the Tally client layer.
//!
//! Constants live on const-only structs; the runtime configuration is
//! [`ClientConfig`], loaded from a JSON file and overridden by environment
//! variables.

use crate::error::{Result, TallyError};
use crate::network::RetryConfig;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Network-related constants.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const DEV_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const PROD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = "Tally-Client/0.3";
    pub const JSON_CONTENT_TYPE: &'static str = "application/json";
    /// Development identity header, mutually exclusive with `Authorization`.
    pub const DEV_USER_HEADER: &'static str = "x-sm-user-id";
    pub const LOGIN_CHECK_PATH: &'static str = "/api/auth/me";
}

/// Rate limit presets.
pub struct RateLimitDefaults;

impl RateLimitDefaults {
    pub const AUTH_ACTION: &'static str = "auth";
    pub const AUTH_MAX_ATTEMPTS: u32 = 5;
    pub const AUTH_WINDOW: Duration = Duration::from_secs(15 * 60);
}

/// Default freshness windows per resource.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const TRANSACTIONS_TTL: Duration = Duration::from_secs(2 * 60);
    pub const BUDGETS_TTL: Duration = Duration::from_secs(5 * 60);
    pub const GOALS_TTL: Duration = Duration::from_secs(10 * 60);
    pub const ACCOUNTS_TTL: Duration = Duration::from_secs(30 * 60);
    pub const CATEGORIES_TTL: Duration = Duration::from_secs(60 * 60);
}

/// Paths used for durable state.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "tally";
    pub const CACHE_DB_FILENAME: &'static str = "cache.db";
}

/// Deployment environment; drives the default request timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }

    /// Default per-request timeout: short while developing, longer in production.
    pub fn default_request_timeout(&self) -> Duration {
        match self {
            Environment::Development => NetworkConfig::DEV_REQUEST_TIMEOUT,
            Environment::Production => NetworkConfig::PROD_REQUEST_TIMEOUT,
        }
    }
}

/// Retry settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: NetworkConfig::MAX_RETRIES,
            base_delay_ms: NetworkConfig::RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: NetworkConfig::RETRY_MAX_DELAY.as_millis() as u64,
            jitter: false,
        }
    }
}

/// Rate limit settings for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_attempts: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: RateLimitDefaults::AUTH_MAX_ATTEMPTS,
            window_secs: RateLimitDefaults::AUTH_WINDOW.as_secs(),
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        RateLimitConfig::new(
            settings.max_attempts,
            Duration::from_secs(settings.window_secs),
        )
    }
}

/// Runtime configuration for a Tally client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the REST backend.
    pub api_base_url: String,
    pub environment: Environment,
    /// Overrides the environment's default timeout.
    pub request_timeout_ms: Option<u64>,
    pub retry: RetrySettings,
    /// SQLite file for the offline cache (default: data dir).
    pub cache_db_path: Option<PathBuf>,
    /// Development identity sent as `x-sm-user-id` when no token is stored.
    pub dev_user_id: Option<String>,
    /// URLs probed to detect connectivity.
    pub probe_urls: Vec<String>,
    pub probe_interval_secs: u64,
    /// Per-resource TTL overrides in seconds, keyed by resource key.
    pub ttl_overrides: HashMap<String, u64>,
    pub auth_rate_limit: RateLimitSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            environment: Environment::default(),
            request_timeout_ms: None,
            retry: RetrySettings::default(),
            cache_db_path: None,
            dev_user_id: None,
            probe_urls: Vec::new(),
            probe_interval_secs: NetworkConfig::PROBE_INTERVAL.as_secs(),
            ttl_overrides: HashMap::new(),
            auth_rate_limit: RateLimitSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load_from_path(p)?,
            None => Self::default(),
        };

        let config = config.with_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TallyError::io_with_path(e, path))?;
        Self::from_json_str(&contents).map_err(|e| TallyError::Config {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
        })
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Apply `TALLY_*` overrides using the given variable lookup.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("TALLY_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(env) = lookup("TALLY_ENV") {
            self.environment = Environment::parse(&env).ok_or_else(|| TallyError::Config {
                message: format!("Unknown TALLY_ENV value: {}", env),
            })?;
        }
        if let Some(user) = lookup("TALLY_DEV_USER_ID") {
            self.dev_user_id = Some(user);
        }
        Ok(self)
    }

    /// Check the values that cannot be expressed through types alone.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_base_url).map_err(|e| TallyError::Validation {
            field: "api_base_url".to_string(),
            message: e.to_string(),
        })?;

        if self.request_timeout_ms == Some(0) {
            return Err(TallyError::Validation {
                field: "request_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.auth_rate_limit.max_attempts == 0 {
            return Err(TallyError::Validation {
                field: "auth_rate_limit.max_attempts".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Effective per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.environment.default_request_timeout())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.retry.max_retries)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
    }

    /// TTL override for a resource key, if configured.
    pub fn ttl_override(&self, resource_key: &str) -> Option<Duration> {
        self.ttl_overrides
            .get(resource_key)
            .copied()
            .map(Duration::from_secs)
    }

    /// Location of the offline cache database.
    pub fn cache_db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cache_db_path {
            return Ok(path.clone());
        }

        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
            .ok_or_else(|| TallyError::Config {
                message: "Could not determine data directory".to_string(),
            })?;

        Ok(data_dir
            .join(PathsConfig::APP_DIR_NAME)
            .join(PathsConfig::CACHE_DB_FILENAME))
    }

    /// Bearer token handed over by the identity provider through `TALLY_TOKEN`.
    pub fn token_from_env() -> Option<String> {
        std::env::var("TALLY_TOKEN").ok().filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_follow_environment() {
        let mut config = ClientConfig::default();
        assert_eq!(config.request_timeout(), NetworkConfig::DEV_REQUEST_TIMEOUT);

        config.environment = Environment::Production;
        assert_eq!(config.request_timeout(), NetworkConfig::PROD_REQUEST_TIMEOUT);
        assert!(NetworkConfig::PROD_REQUEST_TIMEOUT > NetworkConfig::DEV_REQUEST_TIMEOUT);

        config.request_timeout_ms = Some(1500);
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "api_base_url": "https://api.tally.test", "retry": { "max_retries": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.api_base_url, "https://api.tally.test");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.auth_rate_limit.max_attempts, 5);
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::default()
            .with_env_overrides(|name| match name {
                "TALLY_API_BASE_URL" => Some("https://prod.tally.test".to_string()),
                "TALLY_ENV" => Some("prod".to_string()),
                "TALLY_DEV_USER_ID" => Some("user-42".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.api_base_url, "https://prod.tally.test");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.dev_user_id.as_deref(), Some("user-42"));
    }

    #[test]
    fn test_unknown_environment_rejected() {
        let result = ClientConfig::default().with_env_overrides(|name| {
            (name == "TALLY_ENV").then(|| "staging".to_string())
        });
        assert!(matches!(result, Err(TallyError::Config { .. })));
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.api_base_url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(TallyError::Validation { ref field, .. }) if field == "api_base_url"
        ));
    }

    #[test]
    fn test_ttl_override() {
        let mut config = ClientConfig::default();
        config.ttl_overrides.insert("transactions".to_string(), 60);
        assert_eq!(config.ttl_override("transactions"), Some(Duration::from_secs(60)));
        assert_eq!(config.ttl_override("goals"), None);
    }
}
