//! Message types, close status codes, and the terminal connection status.

/// WebSocket close status code per RFC 6455 Section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum CloseCode {
    /// Normal closure (1000).
    #[default]
    Normal,
    /// Going away (1001). Endpoint is shutting down.
    GoingAway,
    /// Protocol error (1002). Malformed frame or RFC violation.
    ProtocolError,
    /// Unsupported data (1003).
    UnsupportedData,
    /// No status received (1005). Local record only, never on the wire.
    NoStatus,
    /// Abnormal closure (1006). Local record only, never on the wire.
    Abnormal,
    /// Invalid payload (1007). Non-UTF-8 data in a text message.
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Mandatory extension (1010).
    MandatoryExtension,
    /// Internal error (1011).
    InternalError,
    /// Try again later (1013). Server at capacity.
    TryAgainLater,
    /// Any other code (registered 1012/1014, or 3000-4999 application codes).
    Other(u16),
}

impl CloseCode {
    /// Create a `CloseCode` from its numeric value.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            1013 => CloseCode::TryAgainLater,
            other => CloseCode::Other(other),
        }
    }

    /// Get the numeric value of this close code.
    #[must_use]
    pub const fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::TryAgainLater => 1013,
            CloseCode::Other(code) => *code,
        }
    }

    /// Whether a received close code is acceptable: 1000-4999 excluding the
    /// reserved set {1004, 1005, 1006, 1015}.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        let code = self.as_u16();
        matches!(code, 1000..=4999) && !self.is_reserved()
    }

    /// Codes that MUST NOT appear in a Close frame on the wire:
    /// 1004 (reserved), 1005 (no status), 1006 (abnormal), 1015 (TLS).
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self.as_u16(), 1004..=1006 | 1015)
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Terminal status of a connection, reported once via `on_close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsStatus {
    /// The close status code (1005 when the peer sent none, 1006 on
    /// transport failure or liveness timeout).
    pub code: CloseCode,
    /// The close reason, empty when none was given.
    pub reason: String,
    /// Whether the close handshake completed before teardown.
    pub clean: bool,
    /// Whether the peer initiated the close.
    pub remote: bool,
}

impl WsStatus {
    pub(crate) fn new(code: CloseCode, reason: impl Into<String>, clean: bool, remote: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            clean,
            remote,
        }
    }
}

impl std::fmt::Display for WsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} \"{}\" ({}, {})",
            self.code.as_u16(),
            self.reason,
            if self.clean { "clean" } else { "unclean" },
            if self.remote { "remote" } else { "local" },
        )
    }
}

/// A complete data message delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Message {
    /// A text message (UTF-8 validated).
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(s.into())
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Message::Binary(data.into())
    }

    /// Returns `true` if this is a text message.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Returns `true` if this is a binary message.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// The message payload as raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(s) => s.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Consume and return the text content, if this is a text message.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }

    /// Consume and return the binary content, if this is a binary message.
    #[must_use]
    pub fn into_binary(self) -> Option<Vec<u8>> {
        match self {
            Message::Binary(data) => Some(data),
            Message::Text(_) => None,
        }
    }

    /// Borrow the text content, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }
}
