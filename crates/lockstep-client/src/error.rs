//! Error types for the command-line client.
//!
//! Every command returns [`ClientError`]; `main` logs it and exits with a
//! non-zero status.

/// Errors that can occur while running a client command.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server could not be reached.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Server URL.
        url: String,
        /// Transport error text.
        reason: String,
    },

    /// Sending or receiving a frame failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server closed the connection before the command finished.
    #[error("connection closed by server")]
    Closed,

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
