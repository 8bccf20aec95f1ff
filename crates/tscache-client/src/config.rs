use std::time::Duration;

use serde::Deserialize;

use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub addr: String,
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    /// Deadline for one command, from the first byte written to the last
    /// byte of the reply. Also bounds the wait for a free pool slot.
    pub op_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11211".to_string(),
            pool_size: 4,
            connect_timeout_ms: 1_000,
            op_timeout_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TSCACHE_ADDR`, `TSCACHE_POOL_SIZE` and
    /// `TSCACHE_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, CacheError> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TSCACHE_ADDR") {
            config.addr = addr;
        }
        if let Ok(size) = std::env::var("TSCACHE_POOL_SIZE") {
            config.pool_size = parse_env("TSCACHE_POOL_SIZE", &size)?;
        }
        if let Ok(ms) = std::env::var("TSCACHE_TIMEOUT_MS") {
            config.op_timeout_ms = parse_env("TSCACHE_TIMEOUT_MS", &ms)?;
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CacheError> {
    value
        .parse()
        .map_err(|_| CacheError::Config(format!("{name}={value}")))
}
