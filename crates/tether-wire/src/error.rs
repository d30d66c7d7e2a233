//! Errors from the wire protocol layer.

use std::time::Duration;
use tether_types::{EnvelopeError, RemoteError};
use thiserror::Error;

/// Errors raised by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection refused: nothing is listening")]
    Refused,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Transport closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Errors from the protocol engine, the call proxy and the lifecycles.
#[derive(Debug, Error)]
pub enum WireError {
    /// No usable transport was supplied, or settings are invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A malformed inbound envelope.
    #[error("Protocol decode error: {0}")]
    Decode(String),

    #[error("Protocol encode error: {0}")]
    Encode(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The peer's handler failed; rebuilt from its error record.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A send was attempted before the transport finished opening.
    #[error("Attempted to send \"{operation}\" without a connection being established")]
    NotConnected { operation: String },

    /// The connection ended while the request was outstanding.
    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Request \"{operation}\" timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The id is already waiting for a reply on this connection.
    #[error("Correlation id {0} is already in use")]
    DuplicateId(String),

    /// A terminal message was handed to `send`, which waits for a reply.
    #[error("Message {id} is terminal and can never be answered")]
    Unanswerable { id: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl WireError {
    /// Whether this error came from the remote handler rather than locally.
    pub fn is_remote(&self) -> bool {
        matches!(self, WireError::Remote(_))
    }
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
