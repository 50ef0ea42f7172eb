//! Error types for the wire protocol layer
//!
//! Covers stream framing, protobuf decoding and the device simulator. Framing
//! errors distinguish resumable conditions (a timeout mid-frame keeps the
//! partial bytes buffered) from corruption that requires a resync.

use thiserror::Error;

/// Errors produced by the framing and protobuf layers
#[derive(Error, Debug)]
pub enum ProtoError {
    // ===== Framing =====
    /// Packet header did not start with the 0x94 0xC3 magic pair
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// Declared payload length exceeds the protocol maximum
    #[error("packet too large: {0} bytes exceeds maximum of {max}", max = crate::framing::MAX_PACKET_SIZE)]
    PacketTooLarge(usize),

    /// A frame is only partially buffered; retrying the read will resume it
    #[error("incomplete packet")]
    IncompletePacket,

    // ===== Protobuf =====
    /// Malformed or truncated protobuf data
    #[error("invalid protobuf data: {0}")]
    InvalidProtobuf(&'static str),

    /// Wire type this decoder cannot skip (groups)
    #[error("unsupported protobuf wire type: {0}")]
    UnsupportedWireType(u8),

    // ===== Simulator =====
    /// PTY allocation failed or is unsupported on this platform
    #[error("pty error: {0}")]
    Pty(String),

    /// Simulator used before `start` or after `stop`
    #[error("device not running")]
    DeviceNotRunning,

    /// Underlying stream I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// True for conditions a read loop should retry rather than surface
    pub fn is_resumable(&self) -> bool {
        match self {
            ProtoError::IncompletePacket => true,
            ProtoError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtoError>;
