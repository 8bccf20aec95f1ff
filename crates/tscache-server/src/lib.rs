mod config;
mod error;
pub mod protocol;
mod server;
mod session;
mod store;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;
pub use store::MemoryCache;
