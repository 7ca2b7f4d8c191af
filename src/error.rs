//! Error types for ipcwire.

use thiserror::Error;

/// Main error type for all ipcwire operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binding the listening endpoint failed (address in use, permission denied, ...).
    #[error("failed to listen on {address}: {source}")]
    Bind {
        /// Endpoint that could not be bound.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Connecting to an endpoint failed (refused, not found, ...).
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Endpoint that could not be reached.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The peer sent bytes that do not form a valid frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every retry-connect attempt failed.
    #[error("gave up connecting after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: Box<IpcError>,
    },

    /// A remote channel call failed on the serving side.
    #[error("Channel error: {0}")]
    Channel(String),

    /// No channel is registered under the given name.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

impl IpcError {
    /// Whether this error describes a malformed frame from the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, IpcError::ProtocolViolation(_))
    }
}

/// Result type alias using IpcError.
pub type Result<T> = std::result::Result<T, IpcError>;
