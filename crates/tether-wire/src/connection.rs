//! Connection driver.
//!
//! One task per connection pumps frames between a [`Transport`] and its
//! [`Protocol`]: inbound frames are read strictly in delivery order, queued
//! outbound items are written in queue order. When the transport reports
//! closure the engine is shut down (failing whatever was still pending) and
//! the close code is published to every [`ConnectionHandle`].

use crate::protocol::{Outbound, Protocol};
use crate::transport::{CloseCode, Transport, TransportEvent};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to wait for the peer to confirm a close before giving up on it.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared view of a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    protocol: Arc<Protocol>,
    closed: watch::Receiver<Option<CloseCode>>,
    local_close: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Engine attached to this connection.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// The close code, once the connection has ended.
    pub fn close_code(&self) -> Option<CloseCode> {
        *self.closed.borrow()
    }

    /// Whether the close was asked for on this side.
    pub fn closed_locally(&self) -> bool {
        self.local_close.load(Ordering::SeqCst)
    }

    /// Wait for the connection to end.
    pub async fn closed(&self) -> CloseCode {
        let mut closed = self.closed.clone();
        loop {
            if let Some(code) = *closed.borrow_and_update() {
                return code;
            }
            if closed.changed().await.is_err() {
                return (*closed.borrow()).unwrap_or(CloseCode::ABNORMAL);
            }
        }
    }

    /// Close with `code` and wait until the transport confirms.
    pub async fn close(&self, code: CloseCode) -> CloseCode {
        self.local_close.store(true, Ordering::SeqCst);
        self.protocol.request_close(code);
        self.closed().await
    }
}

/// Start driving `transport` for `protocol`.
pub fn spawn(
    protocol: Arc<Protocol>,
    outbox: mpsc::UnboundedReceiver<Outbound>,
    transport: Transport,
) -> ConnectionHandle {
    let (handle, driver) = prepare(protocol, outbox, transport);
    tokio::spawn(driver);
    handle
}

/// Like [`spawn`], but leaves starting the driver to the caller, so the
/// connection can be registered before its first frame is read.
pub fn prepare(
    protocol: Arc<Protocol>,
    outbox: mpsc::UnboundedReceiver<Outbound>,
    transport: Transport,
) -> (ConnectionHandle, impl Future<Output = ()> + Send + 'static) {
    let (closed_tx, closed_rx) = watch::channel(None);
    let local_close = Arc::new(AtomicBool::new(false));
    let driver = drive(
        Arc::clone(&protocol),
        outbox,
        transport,
        closed_tx,
        Arc::clone(&local_close),
    );
    let handle = ConnectionHandle {
        protocol,
        closed: closed_rx,
        local_close,
    };
    (handle, driver)
}

async fn drive(
    protocol: Arc<Protocol>,
    mut outbox: mpsc::UnboundedReceiver<Outbound>,
    transport: Transport,
    closed: watch::Sender<Option<CloseCode>>,
    local_close: Arc<AtomicBool>,
) {
    let Transport {
        mut sink,
        mut stream,
        ..
    } = transport;
    let connection = protocol.connection_id();
    // Set once we have sent a close frame: (requested code, deadline).
    let mut closing: Option<(CloseCode, Instant)> = None;
    let mut outbox_open = true;

    let code = loop {
        let close_deadline = closing.map(|(_, deadline)| deadline);
        tokio::select! {
            event = stream.next() => match event {
                TransportEvent::Frame(bytes) => {
                    if let Err(e) = protocol.read(&bytes) {
                        warn!(connection = %connection, error = %e, "Tether: dropping malformed frame");
                    }
                }
                TransportEvent::Closed(code) => break code,
            },
            item = outbox.recv(), if outbox_open => match item {
                Some(Outbound::Frame { bytes, kind }) => {
                    if let Err(e) = sink.send(bytes, kind).await {
                        if closing.is_none() {
                            debug!(connection = %connection, error = %e, "Tether: write failed");
                            break CloseCode::ABNORMAL;
                        }
                    }
                }
                Some(Outbound::Close(code)) => {
                    if closing.is_some() {
                        continue;
                    }
                    local_close.store(true, Ordering::SeqCst);
                    if let Err(e) = sink.close(code).await {
                        debug!(connection = %connection, error = %e, "Tether: close frame not sent");
                        break code;
                    }
                    closing = Some((code, Instant::now() + CLOSE_TIMEOUT));
                }
                None => outbox_open = false,
            },
            _ = sleep_until(close_deadline), if close_deadline.is_some() => {
                warn!(connection = %connection, "Tether: peer did not confirm close in time");
                break closing.map_or(CloseCode::ABNORMAL, |(code, _)| code);
            }
        }
    };

    // Remote-initiated close: make sure our half of the handshake is written.
    if closing.is_none() {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close(code)).await;
    }

    let abandoned = protocol.shutdown();
    debug!(
        connection = %connection,
        code = %code,
        abandoned,
        "Tether: connection ended"
    );
    let _ = closed.send(Some(code));
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
