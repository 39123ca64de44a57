//! Error types for card-server protocol plug-ins.

use thiserror::Error;

/// Protocol-level errors raised while framing, encoding or decoding
/// card-server traffic.
///
/// Any of these ends the current session; the engine reconnects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame payload is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    /// Frame payload is incomplete.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Failed to decode message payload.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    /// Failed to encode message payload.
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    /// The server refused the login.
    #[error("Login rejected: {0}")]
    LoginRejected(String),

    /// The server sent something that is not valid in the current state.
    #[error("Unexpected message: {0}")]
    Unexpected(String),
}
