use tscache_core::CacheEntry;

use crate::config::ClientConfig;
use crate::error::CacheError;
use crate::pool::ConnectionPool;

/// Pooled cache protocol client. Each call checks out one connection for
/// the duration of a single command.
pub struct CacheClient {
    pool: ConnectionPool,
}

impl CacheClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            pool: ConnectionPool::new(config),
        }
    }

    pub fn from_env() -> Result<Self, CacheError> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let result = self.pool.get()?.run(|conn| conn.set(entry));
        tracing::debug!(
            key = %entry.key,
            bytes = entry.value.len(),
            start = entry.time_start,
            end = entry.time_end,
            ok = result.is_ok(),
            "cache put"
        );
        result
    }

    /// Payload stored for `key` over `start..=end`; [`CacheError::NotFound`]
    /// on a miss.
    pub fn get(&self, key: &str, start: i64, end: i64) -> Result<Vec<u8>, CacheError> {
        let result = self.pool.get()?.run(|conn| conn.get(key, start, end));
        match &result {
            Ok(payload) => tracing::debug!(key, bytes = payload.len(), "cache hit"),
            Err(CacheError::NotFound) => tracing::debug!(key, "cache miss"),
            Err(_) => {}
        }
        result
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.pool.get()?.run(|conn| conn.delete(key))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
