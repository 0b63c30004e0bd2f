//! Runtime configuration.
//!
//! Configuration is plain data with sensible defaults, builder-style setters,
//! serde support and an environment loader.
//!
//! # Example
//!
//! ```
//! use statecraft_runtime::config::{ContainerConfig, RuntimeConfig};
//! use std::time::Duration;
//!
//! let config = RuntimeConfig::default().with_container(
//!     ContainerConfig::default()
//!         .with_broadcast_capacity(256)
//!         .with_default_deadline(Duration::from_secs(10)),
//! );
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Environment Variables
//!
//! | Variable                          | Field                               |
//! |-----------------------------------|-------------------------------------|
//! | `STATECRAFT_BROADCAST_CAPACITY`   | `container.broadcast_capacity`      |
//! | `STATECRAFT_REPLAY_LATEST`        | `container.replay_latest`           |
//! | `STATECRAFT_DEFAULT_DEADLINE_MS`  | `container.default_deadline_ms`     |
//! | `STATECRAFT_CLOSE_TIMEOUT_MS`     | `container.close_timeout_ms`        |
//! | `STATECRAFT_CLEANUP_TIMEOUT_MS`   | `scope.cleanup_timeout_ms`          |

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Per-container configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Number of transitions buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Replay the latest transition to new subscribers
    pub replay_latest: bool,
    /// Deadline applied to events sent without an explicit one
    pub default_deadline_ms: Option<u64>,
    /// Time `close` waits for in-flight use cases
    pub close_timeout_ms: u64,
}

impl ContainerConfig {
    /// Set the broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Enable or disable replay of the latest transition
    #[must_use]
    pub const fn with_replay_latest(mut self, replay: bool) -> Self {
        self.replay_latest = replay;
        self
    }

    /// Set the default event deadline
    #[must_use]
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_ms = Some(millis(deadline));
        self
    }

    /// Set the close timeout
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = millis(timeout);
        self
    }

    /// Default event deadline as a `Duration`
    #[must_use]
    pub const fn default_deadline(&self) -> Option<Duration> {
        match self.default_deadline_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }

    /// Close timeout as a `Duration`
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Validate container configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the broadcast capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Validation(
                "broadcast_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 64,
            replay_latest: false,
            default_deadline_ms: None,
            close_timeout_ms: 30_000,
        }
    }
}

/// Scope manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Time the end protocol waits on its cleanup barrier
    pub cleanup_timeout_ms: u64,
}

impl ScopeConfig {
    /// Set the cleanup timeout
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout_ms = millis(timeout);
        self
    }

    /// Cleanup timeout as a `Duration`
    #[must_use]
    pub const fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout_ms: 5_000,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container settings
    pub container: ContainerConfig,
    /// Scope settings
    pub scope: ScopeConfig,
}

impl RuntimeConfig {
    /// Replace the container settings
    #[must_use]
    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.container = container;
        self
    }

    /// Replace the scope settings
    #[must_use]
    pub fn with_scope(mut self, scope: ScopeConfig) -> Self {
        self.scope = scope;
        self
    }

    /// Load configuration from `STATECRAFT_*` environment variables,
    /// falling back to defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable cannot be parsed and
    /// [`ConfigError::Validation`] if the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_var(&lookup, "STATECRAFT_BROADCAST_CAPACITY")? {
            config.container.broadcast_capacity = capacity;
        }
        if let Some(replay) = parse_var(&lookup, "STATECRAFT_REPLAY_LATEST")? {
            config.container.replay_latest = replay;
        }
        if let Some(deadline) = parse_var(&lookup, "STATECRAFT_DEFAULT_DEADLINE_MS")? {
            config.container.default_deadline_ms = Some(deadline);
        }
        if let Some(timeout) = parse_var(&lookup, "STATECRAFT_CLOSE_TIMEOUT_MS")? {
            config.container.close_timeout_ms = timeout;
        }
        if let Some(timeout) = parse_var(&lookup, "STATECRAFT_CLEANUP_TIMEOUT_MS")? {
            config.scope.cleanup_timeout_ms = timeout;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.container.validate()
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}
