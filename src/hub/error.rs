//! Hub error types
//!
//! None of these close the connection: they are reported back to the client
//! as `error` envelopes.

use thiserror::Error;

use super::registry::ConnectionId;

/// Errors from channel and connection bookkeeping
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Channel reached its `maxClients` option
    #[error("Channel {channel} is full")]
    ChannelFull { channel: String, limit: usize },

    /// No live connection with this id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Publishing to a private channel without being subscribed
    #[error("Channel {0} is private")]
    PrivateChannel(String),
}

impl HubError {
    /// Whether this is a configured-limit condition
    pub fn is_capacity(&self) -> bool {
        matches!(self, HubError::ChannelFull { .. })
    }
}

/// Errors from the function-call extension
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Function not found")]
    NotFound(String),

    /// The handler returned an error or panicked
    #[error("{0}")]
    Failed(String),
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;
