//! Shared error types for the envelope model.

use thiserror::Error;

/// Errors raised while building or validating an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Attempted to reply to a terminal `REPLY_TO_REPLY` message.
    #[error("Invalid attempt to reply to a reply (message {id})")]
    InvalidReply {
        /// Correlation id of the terminal message.
        id: String,
    },

    /// A `REQUEST` arrived without an operation name.
    #[error("Request {id} carries no operation name")]
    MissingOperation {
        /// Correlation id of the offending message.
        id: String,
    },

    /// The instruction kind tag is not one of 0, 1, 2.
    #[error("Unknown instruction kind: {0}")]
    UnknownKind(u8),
}

/// An error raised by the remote peer's handler, rebuilt locally.
///
/// Distinct from local failures so callers can tell "my call failed" apart
/// from "the remote operation failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Remote error: {message}")]
pub struct RemoteError {
    /// The remote error message.
    pub message: String,
    /// The remote error's stack (its source chain), kept for diagnostics.
    pub remote_stack: String,
}

impl RemoteError {
    /// Create a remote error from its message and remote stack.
    pub fn new(message: impl Into<String>, remote_stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            remote_stack: remote_stack.into(),
        }
    }
}
