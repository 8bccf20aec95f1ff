use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The command line was rejected; the stream is still in sync.
    #[error("{0}")]
    BadCommand(String),
    /// The stream can no longer be framed, e.g. a SET whose payload length
    /// could not be read. The connection must be closed.
    #[error("{0}")]
    Desync(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
