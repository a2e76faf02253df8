//! Error types for the WebSocket endpoint library.
//!
//! Every failure mode maps onto one of the RFC 6455 close semantics; see
//! [`Error::close_code`] for the status code a connection uses when it has
//! to initiate the close handshake because of an error.

use thiserror::Error;

use crate::message::CloseCode;

/// Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or expired HTTP upgrade on either side.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Frame-level RFC 6455 violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TEXT message payload is not valid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Cumulative inbound message size exceeds the configured maximum.
    #[error("message too big: {size} bytes (max: {max})")]
    MessageTooBig {
        /// Observed size in bytes.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Handler-initiated rejection.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Server is at connection capacity.
    #[error("server at connection capacity")]
    Capacity,

    /// Operation requires an open connection.
    #[error("connection is not open")]
    NotOpen,

    /// Close code outside 1000-4999 or in the reserved set.
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode 0x3-0x7 or 0xB-0xF on the wire.
    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame with FIN=0.
    #[error("control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload over 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Server received an unmasked frame from a client.
    #[error("client frame must be masked")]
    UnmaskedFrame,

    /// Client received a masked frame from a server.
    #[error("server frame must not be masked")]
    MaskedFrame,

    /// RSV1-3 set; the library negotiates no extensions.
    #[error("reserved bits set")]
    ReservedBitsSet,

    /// Not enough buffered bytes to parse a whole frame.
    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// The transport was closed by the peer or torn down locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// URI could not be parsed or has an unsupported scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// TLS configuration or negotiation failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(String),

    /// Unexpected local failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The close status code sent on the wire when this error forces the
    /// connection to initiate the close handshake. `None` means no CLOSE
    /// frame is sent (transport failures record `ABNORMAL_CLOSURE` locally;
    /// 1005/1006/1015 never appear on the wire).
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(_)
            | Error::ReservedOpcode(_)
            | Error::FragmentedControlFrame
            | Error::ControlFrameTooLarge(_)
            | Error::UnmaskedFrame
            | Error::MaskedFrame
            | Error::ReservedBitsSet
            | Error::InvalidCloseCode(_) => Some(CloseCode::ProtocolError),
            Error::InvalidUtf8 => Some(CloseCode::InvalidPayload),
            Error::MessageTooBig { .. } => Some(CloseCode::MessageTooBig),
            Error::PolicyViolation(_) => Some(CloseCode::PolicyViolation),
            Error::Capacity => Some(CloseCode::TryAgainLater),
            Error::Internal(_) => Some(CloseCode::InternalError),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}
