//! Protocol-level errors raised by the wire grammar, registry and codec.

use std::io;
use std::sync::Arc;

use super::registry::MessageTypeId;

/// Errors produced while encoding, decoding or resolving messages.
///
/// Inbound protocol errors are fatal to the session that produced them; they
/// fan out to every pending caller, hence `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("message type {type_id} is already registered in protocol family '{family}'")]
    DuplicateTypeId {
        type_id: MessageTypeId,
        family: String,
    },

    #[error("unknown message type {0}")]
    UnknownTypeId(MessageTypeId),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("incompatible protocol version: local {local}, peer {peer}")]
    IncompatibleProtocolVersion { local: String, peer: String },

    /// Handshake ordering was violated (missing, late or malformed hello).
    #[error("handshake violation: {0}")]
    HandshakeViolation(String),

    #[error("invalid message shape '{shape}': {reason}")]
    InvalidShape { shape: String, reason: String },

    /// Outbound message does not match its registered shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl ProtocolError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptFrame(reason.into())
    }

    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage(reason.into())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
