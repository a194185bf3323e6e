//! Engine configuration
//!
//! Built-in defaults, optionally overlaid by a JSON file, then by
//! `PERPDESK_*` environment variables (a `.env` file is honoured).

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::positions::ReconciliationConfig;
use crate::resilience::{GovernorConfig, RetryPolicy};

pub const ENV_RATE_LIMIT_PER_SEC: &str = "PERPDESK_RATE_LIMIT_PER_SEC";
pub const ENV_RATE_BURST: &str = "PERPDESK_RATE_BURST";
pub const ENV_MAX_WAIT_MS: &str = "PERPDESK_MAX_WAIT_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "PERPDESK_CALL_TIMEOUT_MS";
pub const ENV_MAX_ATTEMPTS: &str = "PERPDESK_MAX_ATTEMPTS";
pub const ENV_RECONCILE_INTERVAL_SECS: &str = "PERPDESK_RECONCILE_INTERVAL_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the engine needs besides the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

impl EngineConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let base = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: shown.clone(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        debug!(path = %shown, "Loaded configuration file");
        Ok(config)
    }

    /// Apply `PERPDESK_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_RATE_LIMIT_PER_SEC)? {
            self.governor.requests_per_second = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_RATE_BURST)? {
            self.governor.burst = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_WAIT_MS)? {
            self.governor.max_wait_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CALL_TIMEOUT_MS)? {
            self.governor.call_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_ATTEMPTS)? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_RECONCILE_INTERVAL_SECS)? {
            self.reconciliation.interval_secs = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.governor.requests_per_second == 0 {
            return Err(ConfigError::Invalid(
                "governor.requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.governor.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "governor.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_fraction must be between 0.0 and 1.0, got {}",
                self.retry.jitter_fraction
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
    }
}
