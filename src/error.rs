//! Error types for the WebSocket engine

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Malformed frame on the wire
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Protocol violation (illegal opcode, fragmentation sequence, RSV misuse)
    Protocol(&'static str),
    /// Connection already closed
    ConnectionClosed,
    /// Connection reset by peer
    ConnectionReset,
    /// Assembled message exceeds the configured limit
    MessageTooLarge,
    /// Single frame exceeds the configured limit
    FrameTooLarge,
    /// Malformed HTTP upgrade response
    InvalidHttp(&'static str),
    /// Handshake rejected (status, accept key, security checks)
    HandshakeFailed(&'static str),
    /// Close frame carried a status code that may not appear on the wire
    InvalidCloseCode(u16),
    /// Compression/decompression error
    Compression(String),
    /// Connection was cancelled locally
    Cancelled,
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may be sent on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Encode as a close frame payload (big-endian code followed by the reason)
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload
    }
}

impl Error {
    /// Status code to send in the close frame when this error ends a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge | Error::FrameTooLarge => CloseReason::TOO_BIG,
            Error::InvalidFrame(_)
            | Error::Protocol(_)
            | Error::InvalidCloseCode(_)
            | Error::Compression(_) => CloseReason::PROTOCOL_ERROR,
            Error::Cancelled => CloseReason::GOING_AWAY,
            _ => CloseReason::ABNORMAL,
        }
    }

    /// Whether this error was produced by the peer violating the wire protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidFrame(_)
                | Error::Protocol(_)
                | Error::InvalidUtf8
                | Error::InvalidCloseCode(_)
                | Error::MessageTooLarge
                | Error::FrameTooLarge
                | Error::Compression(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 payload"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::ConnectionReset => write!(f, "Connection reset by peer"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::Cancelled => write!(f, "Connection cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
