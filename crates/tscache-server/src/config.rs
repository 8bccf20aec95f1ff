use serde::Deserialize;

use crate::error::ServerError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:11211";
const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Largest payload a single SET may carry.
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TSCACHE_SERVER_ADDR` and `TSCACHE_MAX_PAYLOAD`.
    pub fn from_env() -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TSCACHE_SERVER_ADDR") {
            config.addr = addr;
        }
        if let Ok(max) = std::env::var("TSCACHE_MAX_PAYLOAD") {
            config.max_payload = max
                .parse()
                .map_err(|_| ServerError::Config(format!("TSCACHE_MAX_PAYLOAD={max}")))?;
        }
        Ok(config)
    }
}
