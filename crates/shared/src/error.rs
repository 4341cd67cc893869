//! Shared error types.

use thiserror::Error;

/// Errors produced while decoding a STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("frame is missing the NUL terminator")]
    MissingTerminator,
    #[error("frame is missing the blank line before the body")]
    MissingBody,
}
