//! Client side of the cache: the wire protocol adapter, its connection
//! pool and the partial-hit query orchestrator built on top of them.

mod client;
mod config;
mod connection;
mod error;
mod pool;
mod semantic;

pub use client::CacheClient;
pub use config::ClientConfig;
pub use connection::{Connection, escape_key};
pub use error::{CacheError, QueryError};
pub use pool::{ConnectionPool, PooledConnection};
pub use semantic::{CacheOutcome, CachedQuery, Database, SemanticCache};
