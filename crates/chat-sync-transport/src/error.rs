//! Transport error taxonomy.

use thiserror::Error;

use crate::ConnectionState;

/// Transport-level failure. Drives the reconnect policy; never returned to
/// callers of the connection manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to open {url}: {reason}")]
    Open { url: String, reason: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Socket is gone")]
    SocketGone,
}

/// Reconnection has given up. The caller must call `connect` again to resume.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminalError {
    #[error("Gave up reconnecting after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
}

/// Send failure, returned immediately to the caller.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Cannot send while connection is {0}")]
    NotOpen(ConnectionState),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A chat message that was added locally but could not be sent.
///
/// The optimistic entry stays in the store, marked failed, under `local_id`.
#[derive(Debug, Error)]
#[error("Message {local_id} was not sent: {source}")]
pub struct UnsentMessage {
    pub local_id: String,
    #[source]
    pub source: SendError,
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
