use std::io;

use thiserror::Error;
use tscache_core::SegmentError;
use tscache_query::ParseError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("not found")]
    NotFound,
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("cache operation timed out")]
    Timeout,
    /// The reply could not be framed; the connection is out of sync.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// `CLIENT_ERROR`/`SERVER_ERROR` reply. The connection stays usable.
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// Whether the connection that produced this error may have a partly
    /// read reply in flight and must not be reused.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(
            self,
            CacheError::Transport(_) | CacheError::Timeout | CacheError::Protocol(_)
        )
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CacheError::Timeout,
            _ => CacheError::Transport(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}
