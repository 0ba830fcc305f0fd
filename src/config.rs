use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{PoolError, Result};

/// Pool engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Scheduler tick period between background health sweeps
    pub health_check_interval: Duration,
    /// Per-probe timeout
    pub health_check_timeout: Duration,
    /// Maximum simultaneous outbound probes during a batch check
    pub max_concurrent_checks: usize,
    /// Consecutive failures before a proxy becomes eligible for eviction
    pub eviction_threshold: u32,
    /// Cap on the exponential probe backoff for failing proxies
    pub backoff_max_interval: Duration,
    /// How long shutdown waits for in-flight probes before abandoning them
    pub shutdown_grace: Duration,
    /// Known-good target fetched through each proxy during a probe
    pub check_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
            max_concurrent_checks: 20,
            eviction_threshold: 3,
            backoff_max_interval: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(5),
            check_url: "https://httpbin.org/ip".to_string(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            health_check_interval: Duration::from_secs(parse_env_or(
                "POOL_CHECK_INTERVAL",
                defaults.health_check_interval.as_secs(),
            )?),
            health_check_timeout: Duration::from_secs(parse_env_or(
                "POOL_CHECK_TIMEOUT",
                defaults.health_check_timeout.as_secs(),
            )?),
            max_concurrent_checks: parse_env_or(
                "POOL_MAX_CONCURRENT_CHECKS",
                defaults.max_concurrent_checks,
            )?,
            eviction_threshold: parse_env_or(
                "POOL_EVICTION_THRESHOLD",
                defaults.eviction_threshold,
            )?,
            backoff_max_interval: Duration::from_secs(parse_env_or(
                "POOL_BACKOFF_MAX_INTERVAL",
                defaults.backoff_max_interval.as_secs(),
            )?),
            shutdown_grace: Duration::from_secs(parse_env_or(
                "POOL_SHUTDOWN_GRACE",
                defaults.shutdown_grace.as_secs(),
            )?),
            check_url: get_env_or("POOL_CHECK_URL", &defaults.check_url),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_checks == 0 {
            return Err(PoolError::InvalidConfig(
                "POOL_MAX_CONCURRENT_CHECKS must be at least 1".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "POOL_CHECK_INTERVAL must be at least 1 second".into(),
            ));
        }
        self.check_target()?;
        Ok(())
    }

    /// Host and port the probes tunnel to, derived from `check_url`
    pub fn check_target(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.check_url)
            .map_err(|e| PoolError::InvalidConfig(format!("POOL_CHECK_URL: {}", e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidConfig("POOL_CHECK_URL must include a host".into()))?
            .to_string();
        let port = url.port_or_known_default().ok_or_else(|| {
            PoolError::InvalidConfig("POOL_CHECK_URL must have a resolvable port".into())
        })?;

        Ok((host, port))
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse environment variable into T, falling back to a default when unset
fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PoolError::InvalidConfig(format!("{} must be a valid number", key))),
        Err(_) => Ok(default),
    }
}
