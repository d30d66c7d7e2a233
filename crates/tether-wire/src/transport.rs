//! Transport seam.
//!
//! The protocol never opens sockets itself. A client is given a
//! [`Connector`], a server a [`Listener`]; both produce [`Transport`]s, which
//! are a write half ([`TransportSink`]) and a read half ([`TransportStream`]).
//! Implementations live in [`crate::ws`] (WebSocket) and [`crate::memory`]
//! (in-process).

use crate::connection::CLOSE_TIMEOUT;
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;

/// A close status code, as defined by RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal, requested closure.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// The endpoint is going away.
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Close frame carried no status.
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// The connection dropped without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    /// Whether this is the normal-closure code.
    pub fn is_normal(self) -> bool {
        self == Self::NORMAL
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a frame's bytes should be presented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// What the read half of a transport yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound message.
    Frame(Vec<u8>),
    /// The connection is gone. Nothing follows.
    Closed(CloseCode),
}

/// Metadata describing the remote end of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Socket address of the remote end, when there is one.
    pub remote_addr: Option<SocketAddr>,
    /// Request path of the upgrade request.
    pub path: Option<String>,
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
}

/// Write half of a connection.
#[async_trait]
pub trait TransportSink: Send + 'static {
    async fn send(&mut self, frame: Vec<u8>, kind: FrameKind) -> Result<(), TransportError>;

    /// Start a closing handshake with the given status code.
    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError>;
}

/// Read half of a connection.
///
/// `next` must be cancel-safe: the connection driver polls it alongside
/// its outbound queue.
#[async_trait]
pub trait TransportStream: Send + 'static {
    async fn next(&mut self) -> TransportEvent;
}

/// An open connection, split into halves.
pub struct Transport {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
    pub info: PeerInfo,
}

impl Transport {
    /// Run the closing handshake on a connection nobody is driving.
    ///
    /// Returns the code the peer confirmed, or `code` if it did not answer
    /// within [`CLOSE_TIMEOUT`].
    pub async fn close(mut self, code: CloseCode) -> CloseCode {
        if self.sink.close(code).await.is_err() {
            return CloseCode::ABNORMAL;
        }
        let confirmed = async {
            loop {
                if let TransportEvent::Closed(code) = self.stream.next().await {
                    return code;
                }
            }
        };
        tokio::time::timeout(CLOSE_TIMEOUT, confirmed)
            .await
            .unwrap_or(code)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("info", &self.info).finish()
    }
}

/// Client-side factory: opens one connection per call.
///
/// Resolving means the transport is open; an error means it failed to open.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Transport, TransportError>;
}

/// Server-side factory: starts listening.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Resolves once listening is confirmed.
    async fn bind(&self) -> Result<Box<dyn Acceptor>, TransportError>;
}

/// A bound listener. Dropping it stops listening.
#[async_trait]
pub trait Acceptor: Send + 'static {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Wait for the next connection. Cancelling drops any connection still mid-handshake.
    async fn accept(&mut self) -> Result<Transport, TransportError>;

    /// Stop listening and return connections that were established but
    /// never handed out by `accept`. Later arrivals are refused.
    async fn drain(&mut self) -> Vec<Transport>;
}
