//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Serde defaults for every section
//! - JSON file loading
//! - Environment overrides for deployment-specific endpoints

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url in {field}: {source}")]
    Url {
        field: &'static str,
        source: url::ParseError,
    },
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Remote site endpoints shared by probes and the login adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Lightweight page used to probe identity and proxy liveness.
    pub probe_url: String,
    pub login_url: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://www.cnki.net/".into(),
            login_url: "https://login.cnki.net/login/".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub min_identities: usize,
    pub max_failures: u32,
    #[serde(with = "secs")]
    pub max_age: Duration,
    #[serde(with = "secs")]
    pub check_interval: Duration,
    #[serde(with = "secs")]
    pub error_backoff: Duration,
    #[serde(with = "secs")]
    pub probe_timeout: Duration,
    /// Credential-set key whose value identifies a session.
    pub session_key: String,
    pub accounts_file: PathBuf,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            min_identities: 5,
            max_failures: 3,
            max_age: Duration::from_secs(24 * 3600),
            check_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            session_key: "JSESSIONID".into(),
            accounts_file: PathBuf::from("accounts.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub min_endpoints: usize,
    #[serde(with = "secs")]
    pub probe_timeout: Duration,
    #[serde(with = "secs")]
    pub check_interval: Duration,
    #[serde(with = "secs")]
    pub error_backoff: Duration,
    pub supply_url: String,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            min_endpoints: 10,
            probe_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            supply_url: "http://127.0.0.1:5010/get".into(),
        }
    }
}

/// Ban durations applied by `deny_access`, keyed by risk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BanTiers {
    #[serde(with = "secs")]
    pub low: Duration,
    #[serde(with = "secs")]
    pub medium: Duration,
    #[serde(with = "secs")]
    pub high: Duration,
}

impl Default for BanTiers {
    fn default() -> Self {
        Self {
            low: Duration::from_secs(600),
            medium: Duration::from_secs(3600),
            high: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub pattern_limit: usize,
    #[serde(with = "secs")]
    pub pattern_max_age: Duration,
    pub rate_limit_capacity: u32,
    #[serde(with = "secs")]
    pub rate_window: Duration,
    #[serde(with = "secs")]
    pub purge_interval: Duration,
    #[serde(with = "secs")]
    pub error_backoff: Duration,
    pub ban_tiers: BanTiers,
    /// Uniform range (seconds) for the base pre-request delay.
    pub base_delay: (f64, f64),
    pub medium_risk: f64,
    pub high_risk: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            pattern_limit: 100,
            pattern_max_age: Duration::from_secs(24 * 3600),
            rate_limit_capacity: 10,
            rate_window: Duration::from_secs(60),
            purge_interval: Duration::from_secs(3600),
            error_backoff: Duration::from_secs(60),
            ban_tiers: BanTiers::default(),
            base_delay: (1.0, 3.0),
            medium_risk: 0.5,
            high_risk: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_attempts: usize,
    #[serde(with = "secs")]
    pub retry_delay_base: Duration,
    #[serde(with = "secs")]
    pub attempt_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_base: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared result cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "secs")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Complete configuration for a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Namespace prepended to every store key.
    pub key_prefix: String,
    /// Optional redb file; the in-memory store is used when absent.
    pub store_path: Option<PathBuf>,
    pub target: TargetConfig,
    pub credentials: CredentialConfig,
    pub proxies: ProxyPoolConfig,
    pub governor: GovernorConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            key_prefix: "crawlgate".into(),
            store_path: None,
            target: TargetConfig::default(),
            credentials: CredentialConfig::default(),
            proxies: ProxyPoolConfig::default(),
            governor: GovernorConfig::default(),
            executor: ExecutorConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CRAWLGATE_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("CRAWLGATE_TARGET_URL") {
            self.target.probe_url = url;
        }
        if let Ok(url) = std::env::var("CRAWLGATE_LOGIN_URL") {
            self.target.login_url = url;
        }
        if let Ok(url) = std::env::var("CRAWLGATE_PROXY_API_URL") {
            self.proxies.supply_url = url;
        }
        if let Ok(path) = std::env::var("CRAWLGATE_ACCOUNTS_FILE") {
            self.credentials.accounts_file = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, raw) in [
            ("target.probe_url", &self.target.probe_url),
            ("target.login_url", &self.target.login_url),
            ("proxies.supply_url", &self.proxies.supply_url),
        ] {
            Url::parse(raw).map_err(|source| ConfigError::Url { field, source })?;
        }
        Ok(())
    }
}
