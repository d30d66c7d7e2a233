//! In-process transport.
//!
//! Two [`Transport`]s joined by unbounded channels, with the same closing
//! handshake a WebSocket performs: the side that closes sends its code, the
//! other side echoes it, and both streams report `Closed(code)`. Dropping one
//! side without closing is seen by the other as [`CloseCode::ABNORMAL`].
//!
//! [`MemoryHub`] plays the role of a network address: one listener may be
//! bound to it at a time, and its connectors fail with
//! [`TransportError::Refused`] while nothing is bound. `sever_all` drops
//! every live connection abruptly, which is how tests provoke a dirty close.

use crate::error::TransportError;
use crate::transport::{
    Acceptor, CloseCode, Connector, FrameKind, Listener, PeerInfo, Transport, TransportEvent,
    TransportSink, TransportStream,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Debug)]
enum Frame {
    Data(Vec<u8>),
    Close(CloseCode),
}

struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
    close_sent: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>, _kind: FrameKind) -> Result<(), TransportError> {
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Frame::Data(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(Frame::Close(code))
            .map_err(|_| TransportError::Closed)
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
    /// Sender towards the other side, used to echo its close frame.
    echo: mpsc::UnboundedSender<Frame>,
    close_sent: Arc<AtomicBool>,
    severed: watch::Receiver<bool>,
    severable: bool,
    finished: Option<CloseCode>,
}

impl MemoryStream {
    fn finish(&mut self, code: CloseCode) -> TransportEvent {
        self.finished = Some(code);
        TransportEvent::Closed(code)
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn next(&mut self) -> TransportEvent {
        if let Some(code) = self.finished {
            return TransportEvent::Closed(code);
        }
        if *self.severed.borrow() {
            return self.finish(CloseCode::ABNORMAL);
        }
        loop {
            tokio::select! {
                frame = self.rx.recv() => {
                    return match frame {
                        Some(Frame::Data(bytes)) => TransportEvent::Frame(bytes),
                        Some(Frame::Close(code)) => {
                            if !self.close_sent.swap(true, Ordering::SeqCst) {
                                let _ = self.echo.send(Frame::Close(code));
                            }
                            self.finish(code)
                        }
                        None => self.finish(CloseCode::ABNORMAL),
                    };
                }
                changed = self.severed.changed(), if self.severable => {
                    match changed {
                        Ok(()) if *self.severed.borrow() => return self.finish(CloseCode::ABNORMAL),
                        Ok(()) => continue,
                        // Nobody can sever this pair any more.
                        Err(_) => self.severable = false,
                    }
                }
            }
        }
    }
}

fn half(
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    severed: watch::Receiver<bool>,
    info: PeerInfo,
) -> Transport {
    let close_sent = Arc::new(AtomicBool::new(false));
    Transport {
        sink: Box::new(MemorySink {
            tx: tx.clone(),
            close_sent: Arc::clone(&close_sent),
        }),
        stream: Box::new(MemoryStream {
            rx,
            echo: tx,
            close_sent,
            severed,
            severable: true,
            finished: None,
        }),
        info,
    }
}

fn pair_with(severed: watch::Receiver<bool>) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let info = PeerInfo {
        remote_addr: None,
        path: Some("memory".to_string()),
        protocol: None,
    };
    (
        half(a_tx, a_rx, severed.clone(), info.clone()),
        half(b_tx, b_rx, severed, info),
    )
}

/// Create two connected transports.
pub fn duplex() -> (Transport, Transport) {
    let (_kill, severed) = watch::channel(false);
    pair_with(severed)
}

#[derive(Default)]
struct HubInner {
    slot: Mutex<Option<mpsc::UnboundedSender<Transport>>>,
    kills: Mutex<Vec<watch::Sender<bool>>>,
}

/// An in-process "address" that connectors dial and one listener binds.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create a hub with no listener bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that dials this hub.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    /// Listener that binds this hub.
    pub fn listener(&self) -> MemoryListener {
        MemoryListener { hub: self.clone() }
    }

    /// Whether a listener is currently bound.
    pub fn is_listening(&self) -> bool {
        let slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Abruptly drop every live connection. Returns how many were severed.
    pub fn sever_all(&self) -> usize {
        let mut kills = self.inner.kills.lock().unwrap_or_else(|e| e.into_inner());
        let mut severed = 0;
        for kill in kills.drain(..) {
            if kill.send(true).is_ok() {
                severed += 1;
            }
        }
        severed
    }
}

/// Dials a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let slot = self.hub.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        let tx = slot.as_ref().ok_or(TransportError::Refused)?;

        let (kill, severed) = watch::channel(false);
        let (client, server) = pair_with(severed);
        tx.send(server).map_err(|_| TransportError::Refused)?;
        drop(slot);

        let mut kills = self.hub.inner.kills.lock().unwrap_or_else(|e| e.into_inner());
        kills.retain(|k| !k.is_closed());
        kills.push(kill);
        Ok(client)
    }
}

/// Binds a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryListener {
    hub: MemoryHub,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn bind(&self) -> Result<Box<dyn Acceptor>, TransportError> {
        let mut slot = self.hub.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "memory hub already has a listener",
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx.clone());
        Ok(Box::new(MemoryAcceptor {
            hub: self.hub.clone(),
            tx,
            rx,
        }))
    }
}

struct MemoryAcceptor {
    hub: MemoryHub,
    tx: mpsc::UnboundedSender<Transport>,
    rx: mpsc::UnboundedReceiver<Transport>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn accept(&mut self) -> Result<Transport, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn drain(&mut self) -> Vec<Transport> {
        self.unbind();
        self.rx.close();
        let mut queued = Vec::new();
        while let Ok(transport) = self.rx.try_recv() {
            queued.push(transport);
        }
        queued
    }
}

impl MemoryAcceptor {
    fn unbind(&self) {
        let mut slot = self.hub.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|tx| tx.same_channel(&self.tx)) {
            *slot = None;
        }
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.unbind();
    }
}
