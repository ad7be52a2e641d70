//! Error types for Hypha Core.
//!
//! Everything that can end a connection is a [`CloseReason`]. Reasons are
//! scoped to a single connection and never propagate to the node or to other
//! peers.

use hypha_crypto::IdentityError;
use hypha_transport::{CodecError, TransportError};
use thiserror::Error;

// ============================================================================
// Connection close reasons
// ============================================================================

/// Why a connection reached `Closed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local node (`close()` or node shutdown).
    #[error("closed locally")]
    LocalClose,

    /// A newer connection authenticated as the same peer.
    #[error("replaced by a newer connection to the same peer")]
    Replaced,

    /// The peer's handshake signature did not verify.
    #[error("handshake signature invalid")]
    SignatureInvalid,

    /// No handshake arrived in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer presented our own public key.
    #[error("peer presented our own identity")]
    SelfConnection,

    /// A well-formed message arrived in a state that does not accept it.
    #[error("unexpected message type 0x{0:02x}")]
    UnexpectedMessage(u8),

    /// The byte stream could not be decoded.
    #[error("framing error: {0}")]
    Framing(CodecError),

    /// A context stream exceeded the configured maximum.
    #[error("context payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The outbound queue grew past its byte limit.
    #[error("write queue limit exceeded")]
    WriteBackpressureExceeded,

    /// Too many heartbeat intervals passed without hearing from the peer.
    #[error("missed {missed} heartbeat intervals")]
    HeartbeatTimeout { missed: u32 },

    /// The peer closed the transport.
    #[error("transport closed by peer")]
    TransportClosed,

    /// Transport I/O failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CloseReason {
    /// Stable upper-case code used in `PEER_REJECTED ... REASON=<CODE>`.
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::LocalClose => "LOCAL_CLOSE",
            CloseReason::Replaced => "REPLACED",
            CloseReason::SignatureInvalid => "SIGNATURE_INVALID",
            CloseReason::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            CloseReason::SelfConnection => "SELF_CONNECTION",
            CloseReason::UnexpectedMessage(_) => "UNEXPECTED_MESSAGE",
            CloseReason::Framing(CodecError::UnsupportedVersion(_)) => "UNSUPPORTED_VERSION",
            CloseReason::Framing(CodecError::UnknownMessageType(_)) => "UNKNOWN_MESSAGE_TYPE",
            CloseReason::Framing(_) => "MALFORMED",
            CloseReason::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            CloseReason::WriteBackpressureExceeded => "WRITE_BACKPRESSURE",
            CloseReason::HeartbeatTimeout { .. } => "HEARTBEAT_TIMEOUT",
            CloseReason::TransportClosed => "TRANSPORT_CLOSED",
            CloseReason::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// Whether closing for this reason is reported as `PEER_REJECTED`
    /// rather than `PEER_LEAVE`.
    ///
    /// Authentication and resource violations are always rejections. Protocol
    /// violations are rejections only while the peer is unauthenticated; once
    /// authenticated, a broken stream is just a departure.
    pub fn is_rejection(&self, was_authenticated: bool) -> bool {
        match self {
            CloseReason::SignatureInvalid
            | CloseReason::HandshakeTimeout
            | CloseReason::SelfConnection
            | CloseReason::PayloadTooLarge { .. }
            | CloseReason::WriteBackpressureExceeded => true,
            CloseReason::UnexpectedMessage(_) | CloseReason::Framing(_) => !was_authenticated,
            CloseReason::LocalClose
            | CloseReason::Replaced
            | CloseReason::HeartbeatTimeout { .. }
            | CloseReason::TransportClosed
            | CloseReason::Transport(_) => false,
        }
    }
}

impl From<CodecError> for CloseReason {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::PayloadTooLarge { len, max } => CloseReason::PayloadTooLarge { len, max },
            other => CloseReason::Framing(other),
        }
    }
}

impl From<std::io::Error> for CloseReason {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => CloseReason::TransportClosed,
            _ => CloseReason::Transport(e.to_string()),
        }
    }
}

// ============================================================================
// Handle, node and configuration errors
// ============================================================================

/// Errors returned by `ConnectionHandle` operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Context can only be sent once the handshake has completed.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// Refused locally; the connection stays open.
    #[error("context payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("connection closed: {0}")]
    Closed(CloseReason),
}

/// Errors returned by `Node` lifecycle operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("discovery error: {0}")]
    Discovery(#[from] TransportError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid seed: {0}")]
    Seed(#[from] IdentityError),
}
