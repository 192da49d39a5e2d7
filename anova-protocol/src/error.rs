//! Protocol-level error types

use thiserror::Error;

/// Errors that can occur while framing, encoding or decoding the wire protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid header: expected 0x68, got 0x{0:02x}")]
    InvalidHeader(u8),

    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("frame is incomplete: need {needed} bytes, have {have}")]
    Incomplete { needed: usize, have: usize },

    #[error("decoded payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("command argument out of range: {0}")]
    Validation(String),

    #[error("command not supported on this transport")]
    TransportUnsupported,

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("could not parse response {response:?} for command {command}")]
    ResponseParse { command: &'static str, response: String },
}
