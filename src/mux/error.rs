//! Multiplexer error types
//!
//! Any condition that means the two endpoints disagree about the state of a
//! stream is a [`ViolationKind`]. Violations are fatal for the whole
//! connection and reach the caller as a single [`ConnectionError`].

use super::packet::PacketKind;
use super::StreamId;
use std::fmt;

/// Reasons a variable-length integer fails to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntError {
    /// The buffer ends before the integer does
    #[error("truncated")]
    Truncated,
    /// The value fits a shorter encoding
    #[error("non-minimal encoding")]
    NonMinimal,
    /// Zero where the protocol requires a value of at least one
    #[error("zero in a non-zero field")]
    Zero,
}

/// Errors produced while decoding bytes into packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Malformed variable-length integer
    #[error("malformed integer: {0}")]
    MalformedInt(IntError),

    /// Structurally invalid packet
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// More bytes are needed before the packet can be decoded
    #[error("incomplete packet")]
    Incomplete,
}

impl DecodeError {
    /// Check whether the error only signals missing bytes
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            DecodeError::Incomplete | DecodeError::MalformedInt(IntError::Truncated)
        )
    }
}

impl From<IntError> for DecodeError {
    fn from(err: IntError) -> Self {
        DecodeError::MalformedInt(err)
    }
}

/// Errors produced while encoding packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A field that must be at least one was zero
    #[error("{0} requires a non-zero amount")]
    ZeroAmount(PacketKind),

    /// The stream id parity does not allow this packet kind
    #[error("{kind} cannot be sent on stream {id}")]
    IdOutOfRole { kind: PacketKind, id: StreamId },
}

/// Protocol violation taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Truncated or non-canonical integer
    MalformedInt,
    /// Truncated or non-canonical packet
    MalformedPacket,
    /// A write consumed more than the available credit
    CreditExceeded,
    /// Cumulative credit does not fit in 64 bits
    CreditOverflow,
    /// A StopRead or StopWrite raised a previously announced limit
    LimitIncreased,
    /// A write or grant spent more than the announced remaining limit
    LimitExceeded,
    /// A ForgoCredit exceeds the outstanding balance
    ForgoExceedsBalance,
    /// Terminal write outside FinalPending, or a write after the terminal one
    UnexpectedFinalItem,
    /// A regular write where only the terminal write is allowed
    MissingFinalItem,
    /// Packet kind not permitted for the stream id's parity
    IdOutOfRole,
}

impl ViolationKind {
    /// Get the stable tag name
    pub fn name(&self) -> &'static str {
        match self {
            ViolationKind::MalformedInt => "MALFORMED_INT",
            ViolationKind::MalformedPacket => "MALFORMED_PACKET",
            ViolationKind::CreditExceeded => "CREDIT_EXCEEDED",
            ViolationKind::CreditOverflow => "CREDIT_OVERFLOW",
            ViolationKind::LimitIncreased => "LIMIT_INCREASED",
            ViolationKind::LimitExceeded => "LIMIT_EXCEEDED",
            ViolationKind::ForgoExceedsBalance => "FORGO_EXCEEDS_BALANCE",
            ViolationKind::UnexpectedFinalItem => "UNEXPECTED_FINAL_ITEM",
            ViolationKind::MissingFinalItem => "MISSING_FINAL_ITEM",
            ViolationKind::IdOutOfRole => "ID_OUT_OF_ROLE",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<DecodeError> for ViolationKind {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::MalformedInt(_) => ViolationKind::MalformedInt,
            DecodeError::MalformedPacket(_) | DecodeError::Incomplete => {
                ViolationKind::MalformedPacket
            }
        }
    }
}

impl From<EncodeError> for ViolationKind {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::ZeroAmount(_) => ViolationKind::MalformedInt,
            EncodeError::IdOutOfRole { .. } => ViolationKind::IdOutOfRole,
        }
    }
}

/// Terminal error of a connection
///
/// Carries the violation tag and, when known, the offending stream id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ConnectionError {
    pub kind: ViolationKind,
    pub id: Option<StreamId>,
}

impl ConnectionError {
    /// Create a connection error for a stream
    pub fn on_stream(kind: ViolationKind, id: StreamId) -> Self {
        ConnectionError { kind, id: Some(id) }
    }

    /// Create a connection error not attributable to a stream
    pub fn connection(kind: ViolationKind) -> Self {
        ConnectionError { kind, id: None }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} on stream {}", self.kind, id),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Multiplexer errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the underlying transport
    #[error("Transport error: {0}")]
    Transport(crate::session::Error),

    /// The connection was terminated by a protocol violation
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ConnectionError),

    /// Packet could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Not enough credit yet; retry once the peer grants more
    #[error("Stream {id} needs {needed} credit, {available} available")]
    WouldBlock {
        id: StreamId,
        needed: u64,
        available: u64,
    },

    /// Local request refused before anything was sent
    #[error("Refused on stream {id}: {kind}")]
    Usage { id: StreamId, kind: ViolationKind },

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Timeout waiting for the transport
    #[error("Timeout")]
    Timeout,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<crate::session::Error> for Error {
    fn from(err: crate::session::Error) -> Self {
        match err {
            crate::session::Error::Timeout => Error::Timeout,
            crate::session::Error::ConnectionClosed => Error::ConnectionClosed,
            other => Error::Transport(other),
        }
    }
}

/// Result type for multiplexer operations
pub type Result<T> = std::result::Result<T, Error>;
