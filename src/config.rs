//! Link configuration.
//!
//! Configuration can be built from defaults, a JSON document, a JSON file, or
//! `OBJWIRE_*` environment variables, and adjusted with `with_*` setters.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferPool, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE};
use crate::error::{Result, WireError};
use crate::send::MAX_DRAIN_BYTES;

/// Default bytes left free in front of every received payload.
pub const DEFAULT_HEADER_RESERVE: usize = 16;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Reconnect backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied per consecutive failure (2.0 doubles the delay).
    pub backoff_multiplier: f64,
    /// Consecutive failures before giving up (`None` = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another retry is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

/// Settings shared by every connection of an endpoint or listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Size of every pooled buffer.
    pub buffer_capacity: usize,
    /// Leading bytes reserved in receive buffers.
    pub header_reserve: usize,
    /// Byte budget passed to `Session::fill`.
    pub max_drain_bytes: usize,
    /// Idle buffers the pool keeps for reuse.
    pub max_idle_buffers: usize,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Backoff policy for remote endpoints.
    pub reconnect: ReconnectConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            header_reserve: DEFAULT_HEADER_RESERVE,
            max_drain_bytes: MAX_DRAIN_BYTES,
            max_idle_buffers: DEFAULT_MAX_IDLE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WireError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WireError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `OBJWIRE_BUFFER_CAPACITY`: pooled buffer size in bytes
    /// - `OBJWIRE_HEADER_RESERVE`: receive header reserve in bytes
    /// - `OBJWIRE_MAX_DRAIN_BYTES`: fill budget per drain
    /// - `OBJWIRE_MAX_IDLE_BUFFERS`: idle buffers kept by the pool
    /// - `OBJWIRE_CONNECT_TIMEOUT`: connect timeout in ms
    /// - `OBJWIRE_RECONNECT_DELAY`: initial retry delay in ms
    /// - `OBJWIRE_RECONNECT_MAX_DELAY`: retry delay cap in ms
    /// - `OBJWIRE_RECONNECT_ATTEMPTS`: retry limit (unset or 0 = unlimited)
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let defaults = Self::default();
        let config = Self {
            buffer_capacity: parsed(lookup("OBJWIRE_BUFFER_CAPACITY"), defaults.buffer_capacity),
            header_reserve: parsed(lookup("OBJWIRE_HEADER_RESERVE"), defaults.header_reserve),
            max_drain_bytes: parsed(lookup("OBJWIRE_MAX_DRAIN_BYTES"), defaults.max_drain_bytes),
            max_idle_buffers: parsed(lookup("OBJWIRE_MAX_IDLE_BUFFERS"), defaults.max_idle_buffers),
            connect_timeout_ms: parsed(
                lookup("OBJWIRE_CONNECT_TIMEOUT"),
                defaults.connect_timeout_ms,
            ),
            reconnect: ReconnectConfig {
                initial_delay_ms: parsed(
                    lookup("OBJWIRE_RECONNECT_DELAY"),
                    defaults.reconnect.initial_delay_ms,
                ),
                max_delay_ms: parsed(
                    lookup("OBJWIRE_RECONNECT_MAX_DELAY"),
                    defaults.reconnect.max_delay_ms,
                ),
                max_attempts: lookup("OBJWIRE_RECONNECT_ATTEMPTS")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .filter(|&n| n > 0),
                ..defaults.reconnect
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(WireError::Config("buffer_capacity must be > 0".into()));
        }
        if self.header_reserve >= self.buffer_capacity {
            return Err(WireError::Config(format!(
                "header_reserve ({}) must be smaller than buffer_capacity ({})",
                self.header_reserve, self.buffer_capacity
            )));
        }
        if self.max_drain_bytes == 0 {
            return Err(WireError::Config("max_drain_bytes must be > 0".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(WireError::Config(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Validate, and check that `pool` buffers leave room after the header
    /// reserve.
    pub fn validate_for_pool(&self, pool: &BufferPool) -> Result<()> {
        self.validate()?;
        if pool.buffer_capacity() <= self.header_reserve {
            return Err(WireError::Config(format!(
                "pool buffers ({} bytes) cannot hold the header reserve ({} bytes)",
                pool.buffer_capacity(),
                self.header_reserve
            )));
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Set the pooled buffer size.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the receive header reserve.
    pub fn with_header_reserve(mut self, reserve: usize) -> Self {
        self.header_reserve = reserve;
        self
    }

    /// Set the fill budget per drain.
    pub fn with_max_drain_bytes(mut self, max: usize) -> Self {
        self.max_drain_bytes = max;
        self
    }

    /// Set the idle buffer bound.
    pub fn with_max_idle_buffers(mut self, max: usize) -> Self {
        self.max_idle_buffers = max;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Replace the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}
