use tscache_server::{MemoryCache, Server, ServerConfig, ServerError};

fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    let server = Server::new(MemoryCache::new(), config);
    server.serve()
}
