//! Server error types

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that stop the server from starting or running
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to read {path:?}: {error}")]
    Certificate { path: PathBuf, error: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The reactor is gone, so commands can no longer be delivered
    #[error("Server is not running")]
    Stopped,
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;
