//! Configuration for the lock participant.
//!
//! Defaults cover everything except the KV prefix and the weight. Values
//! can come from code, a TOML file, or the standard Consul environment
//! variables, with later layers overriding earlier ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::http::HttpClient;
use crate::kv::KvClient;
use crate::lock::{WLock, WLockOptions};
use crate::session::SessionClient;

const ENV_ADDRESS: &str = "CONSUL_HTTP_ADDR";
const ENV_TOKEN: &str = "CONSUL_HTTP_TOKEN";

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid
    InvalidValue {
        /// The offending key.
        key: String,
        /// The value as configured.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A required configuration value is missing
    MissingRequired {
        /// The missing key.
        key: String,
        /// How to provide it.
        hint: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
            ConfigError::MissingRequired { key, hint } => {
                write!(f, "Missing required configuration: {} ({})", key, hint)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// All tunables of a lock participant. Durations are plain seconds so the
/// TOML form stays flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Consul agent.
    pub consul_http_address: String,
    /// ACL token sent as `X-Consul-Token`, if any.
    pub token: Option<String>,
    /// KV prefix for the lock and contender keys. Required.
    pub kv_prefix: String,
    /// This participant's weight; the highest live weight wins the lock.
    pub weight: f64,
    /// Preemption dampening in seconds.
    pub delay: f64,
    /// Opaque payload published with the contender and lock keys.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub info: Value,
    /// Session TTL in seconds.
    pub session_ttl: f64,
    /// Blocking-query wait in seconds.
    pub wait: f64,
    /// Watcher steady rate, calls per second.
    pub rate_limit: f64,
    /// Watcher token bucket capacity.
    pub rate_limit_burst: u32,
    /// Watcher tokens available at startup.
    pub rate_limit_init_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consul_http_address: "http://localhost:8500".to_string(),
            token: None,
            kv_prefix: String::new(),
            weight: 0.0,
            delay: 0.0,
            info: Value::Null,
            session_ttl: 15.0,
            wait: 20.0,
            rate_limit: 1.0,
            rate_limit_burst: 10,
            rate_limit_init_burst: 5,
        }
    }
}

impl Config {
    /// Defaults plus the two required values.
    pub fn new(kv_prefix: impl Into<String>, weight: f64) -> Self {
        Self {
            kv_prefix: kv_prefix.into(),
            weight,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::InvalidValue {
                key: "config_file".to_string(),
                value: path.as_ref().display().to_string(),
                reason: format!("Failed to read file: {}", e),
            })?;
        toml::from_str(&contents).map_err(|e| ConfigError::InvalidValue {
            key: "config_file".to_string(),
            value: path.as_ref().display().to_string(),
            reason: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Override address and token from `CONSUL_HTTP_ADDR` /
    /// `CONSUL_HTTP_TOKEN` when set.
    pub fn apply_env(&mut self) {
        if let Ok(address) = std::env::var(ENV_ADDRESS) {
            if !address.is_empty() {
                self.consul_http_address = address;
            }
        }
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }
    }

    /// Check every value; returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kv_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "kv_prefix".to_string(),
                hint: "set the KV prefix the lock should live under".to_string(),
            });
        }
        if self.kv_prefix.ends_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "kv_prefix".to_string(),
                value: self.kv_prefix.clone(),
                reason: "must not end with '/'".to_string(),
            });
        }
        if !self.weight.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "weight".to_string(),
                value: self.weight.to_string(),
                reason: "must be a finite number".to_string(),
            });
        }
        if self.delay < 0.0 || !self.delay.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "delay".to_string(),
                value: self.delay.to_string(),
                reason: "must be a non-negative number of seconds".to_string(),
            });
        }
        if self.session_ttl <= 0.0 || !self.session_ttl.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "session_ttl".to_string(),
                value: self.session_ttl.to_string(),
                reason: "must be a positive number of seconds".to_string(),
            });
        }
        if self.wait <= 0.0 || !self.wait.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "wait".to_string(),
                value: self.wait.to_string(),
                reason: "must be a positive number of seconds".to_string(),
            });
        }
        if self.rate_limit <= 0.0 || !self.rate_limit.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "rate_limit".to_string(),
                value: self.rate_limit.to_string(),
                reason: "must be a positive rate".to_string(),
            });
        }
        if self.rate_limit_burst == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_limit_burst".to_string(),
                value: "0".to_string(),
                reason: "must allow at least one call".to_string(),
            });
        }
        Ok(())
    }

    /// Preemption dampening as a [`Duration`].
    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.delay)
    }

    /// Session TTL as a [`Duration`].
    pub fn session_ttl_duration(&self) -> Duration {
        Duration::from_secs_f64(self.session_ttl)
    }

    /// Blocking-query wait as a [`Duration`].
    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs_f64(self.wait)
    }

    /// Lock options derived from this configuration.
    pub fn wlock_options(&self) -> WLockOptions {
        WLockOptions {
            prefix: self.kv_prefix.clone(),
            weight: self.weight,
            delay: self.delay_duration(),
            info: self.info.clone(),
            session_ttl: self.session_ttl_duration(),
            wait: self.wait_duration(),
            rate_limit: self.rate_limit,
            rate_limit_burst: self.rate_limit_burst,
            rate_limit_init_burst: self.rate_limit_init_burst,
        }
    }

    /// Validate and wire up a ready-to-run [`WLock`].
    pub fn build_lock(&self) -> Result<WLock, ConfigError> {
        self.validate()?;
        let http = HttpClient::new(&self.consul_http_address, self.token.clone()).map_err(
            |err| ConfigError::InvalidValue {
                key: "consul_http_address".to_string(),
                value: self.consul_http_address.clone(),
                reason: err.to_string(),
            },
        )?;
        let kv = KvClient::new(http.clone());
        let sessions = SessionClient::new(http);
        Ok(WLock::new(kv, sessions, self.wlock_options()))
    }
}
