use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid resume cursor {cursor:?}: {message}")]
    InvalidCursor { cursor: String, message: String },

    #[error("Metadata error: {message}")]
    Consistency { message: String },

    #[error("Unsupported source state: {message}")]
    Unsupported { message: String },

    #[error("Replication error: {message}")]
    Replication { message: String },

    #[error("Invalid replication message: {message}")]
    InvalidMessage { message: String },

    #[error("Replication stream ended before the fence was reached")]
    FenceNotReached,

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Shutdown requested")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
