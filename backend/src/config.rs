use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::{CircuitBreakerConfig, EmergencyStopConfig, EngineConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL; `None` runs on the in-memory store
    pub database_url: Option<String>,
    /// Maximum database connections in pool
    pub database_max_connections: u32,
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Upper bound on every store call in milliseconds (default: 500)
    pub store_timeout_ms: u64,
    /// Maintenance sweep interval in seconds (default: 300)
    pub maintenance_interval_secs: u64,
    /// Limit recalibration interval in seconds (default: 900)
    pub limit_adjustment_interval_secs: u64,
    /// Outbox relay interval in seconds (default: 10)
    pub outbox_relay_interval_secs: u64,
    /// Consecutive failures that open a breaker (default: 5)
    pub breaker_failure_threshold: u32,
    /// HALF_OPEN successes that close a breaker (default: 2)
    pub breaker_recovery_threshold: u32,
    /// OPEN cooldown in seconds (default: 1800)
    pub breaker_cooldown_secs: u64,
    /// Recent failure rate above which resume is refused (default: 0.6)
    pub resume_failure_rate_threshold: f64,
    /// Whether a status read resumes an expired auto-resumable stop (default: true)
    pub lazy_resume_on_read: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            host: "127.0.0.1".to_string(),
            port: 8080,
            store_timeout_ms: 500,
            maintenance_interval_secs: 300,
            limit_adjustment_interval_secs: 900,
            outbox_relay_interval_secs: 10,
            breaker_failure_threshold: 5,
            breaker_recovery_threshold: 2,
            breaker_cooldown_secs: 1800,
            resume_failure_rate_threshold: 0.6,
            lazy_resume_on_read: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup` (environment access is injectable for tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let host = lookup("HOST").unwrap_or(defaults.host);

        let config = Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.database_max_connections)?,
            host,
            port: parse_or(&lookup, "PORT", defaults.port)?,
            store_timeout_ms: parse_or(&lookup, "STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            maintenance_interval_secs: parse_or(&lookup, "MAINTENANCE_INTERVAL_SECS", defaults.maintenance_interval_secs)?,
            limit_adjustment_interval_secs: parse_or(
                &lookup,
                "LIMIT_ADJUSTMENT_INTERVAL_SECS",
                defaults.limit_adjustment_interval_secs,
            )?,
            outbox_relay_interval_secs: parse_or(&lookup, "OUTBOX_RELAY_INTERVAL_SECS", defaults.outbox_relay_interval_secs)?,
            breaker_failure_threshold: parse_or(&lookup, "BREAKER_FAILURE_THRESHOLD", defaults.breaker_failure_threshold)?,
            breaker_recovery_threshold: parse_or(&lookup, "BREAKER_RECOVERY_THRESHOLD", defaults.breaker_recovery_threshold)?,
            breaker_cooldown_secs: parse_or(&lookup, "BREAKER_COOLDOWN_SECS", defaults.breaker_cooldown_secs)?,
            resume_failure_rate_threshold: parse_or(
                &lookup,
                "RESUME_FAILURE_RATE_THRESHOLD",
                defaults.resume_failure_rate_threshold,
            )?,
            lazy_resume_on_read: parse_or(&lookup, "LAZY_RESUME_ON_READ", defaults.lazy_resume_on_read)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("STORE_TIMEOUT_MS"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue("BREAKER_FAILURE_THRESHOLD"));
        }
        if self.breaker_recovery_threshold == 0 {
            return Err(ConfigError::InvalidValue("BREAKER_RECOVERY_THRESHOLD"));
        }
        if !(0.0..=1.0).contains(&self.resume_failure_rate_threshold) {
            return Err(ConfigError::InvalidValue("RESUME_FAILURE_RATE_THRESHOLD"));
        }
        for (name, secs) in [
            ("MAINTENANCE_INTERVAL_SECS", self.maintenance_interval_secs),
            ("LIMIT_ADJUSTMENT_INTERVAL_SECS", self.limit_adjustment_interval_secs),
            ("OUTBOX_RELAY_INTERVAL_SECS", self.outbox_relay_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue(name));
            }
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Component policies with the environment overrides applied
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                recovery_threshold: self.breaker_recovery_threshold,
                cooldown: chrono::Duration::seconds(self.breaker_cooldown_secs as i64),
                ..CircuitBreakerConfig::default()
            },
            emergency: EmergencyStopConfig {
                resume_failure_rate_threshold: self.resume_failure_rate_threshold,
                lazy_resume_on_read: self.lazy_resume_on_read,
                ..EmergencyStopConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
