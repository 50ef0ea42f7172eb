//! Error types for the relay service
//!
//! One crate-level enum grouped by subsystem: transport, sinks,
//! configuration and lifecycle. Protocol-layer errors from
//! `meshrelay-proto` wrap transparently.

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    // ===== Transport =====
    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,

    /// Connect did not complete within its deadline
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    /// Transport-level connect failure
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed {
        /// Endpoint description (port path, address or broker URL)
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// Read-side transport failure
    #[error("read error: {0}")]
    ReadError(String),

    /// Write-side transport failure
    #[error("write error: {0}")]
    WriteError(String),

    // ===== Sinks =====
    /// Sink endpoint rejected or failed the delivery
    #[error("{0}")]
    SinkUnavailable(String),

    /// Packet could not be serialized for a sink
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ===== Configuration =====
    /// Validation failure; the message is already user-facing
    #[error("{0}")]
    InvalidConfig(String),

    // ===== Lifecycle =====
    /// `start` called while the service is running
    #[error("service is already running")]
    AlreadyRunning,

    /// Operation requires a running service
    #[error("service is not running")]
    NotRunning,

    /// Operation aborted by cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Wire protocol error
    #[error(transparent)]
    Proto(#[from] meshrelay_proto::ProtoError),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_displays_message_verbatim() {
        let err = RelayError::InvalidConfig(
            "connection.mqtt.broker is required for mqtt connection".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "connection.mqtt.broker is required for mqtt connection"
        );
    }

    #[test]
    fn test_proto_error_wraps_transparently() {
        let err = RelayError::from(meshrelay_proto::ProtoError::InvalidMagic);
        assert_eq!(err.to_string(), "invalid magic bytes");
    }
}
