//! Client lifecycle.
//!
//! A [`Client`] runs one protocol engine over one transport at a time. The
//! handler registry and event listeners belong to the client, so they carry
//! over when the transport is replaced.
//!
//! State machine:
//!
//! ```text
//! Closed ──open()──▶ Opening ──ok──▶ Open ──clean close──▶ Closed
//!                       │                │
//!                       └─err─▶ Closed   └─dirty close──▶ Reconnecting ──ok──▶ Open
//! ```
//!
//! A close is clean when it was asked for locally or carries the normal
//! status code. Every `open()` or `close()` starts a new epoch; a
//! reconnection loop only acts while its epoch is current, so an explicit
//! call always wins over a loop still in flight.

use crate::backoff::{delay_ms, Backoff, Clock, TokioClock};
use crate::codec::{codec_for, Codec};
use crate::connection::{self, ConnectionHandle};
use crate::error::{WireError, WireResult};
use crate::events::{ClientEvent, ClientEventKind, Emitter};
use crate::handlers::Handlers;
use crate::protocol::{InboundRequest, Protocol, Reply};
use crate::proxy::Remote;
use crate::transport::{CloseCode, Connector};
use crate::ws::WebSocketConnector;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tether_types::config::ClientConfig;
use tether_types::Message;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Reconnecting,
}

/// Builds a [`Client`] from configuration and an injected transport.
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    clock: Arc<dyn Clock>,
}

impl ClientBuilder {
    /// Start a builder with no connector and the codec named in `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            codec: None,
            clock: Arc::new(TokioClock),
        }
    }

    /// The transport factory. Required.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Override the codec chosen by `config.codec`.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Clock used for reconnection delays.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validate the configuration and assemble the client.
    pub fn build(self) -> WireResult<Client> {
        self.config.validate().map_err(WireError::Configuration)?;
        let connector = self.connector.ok_or_else(|| {
            WireError::Configuration("No transport connector was supplied".to_string())
        })?;
        let codec = self.codec.unwrap_or_else(|| codec_for(self.config.codec));
        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                connector,
                codec,
                clock: self.clock,
                handlers: Arc::new(Handlers::new()),
                events: Emitter::new(),
                state: RwLock::new(ConnectionState::Closed),
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                reconnecting: Mutex::new(None),
            }),
        })
    }
}

/// The client endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct Live {
    generation: u64,
    handle: ConnectionHandle,
}

struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    handlers: Arc<Handlers>,
    events: Emitter<ClientEvent>,
    state: RwLock<ConnectionState>,
    current: RwLock<Option<Live>>,
    generation: AtomicU64,
    epoch: AtomicU64,
    /// Epoch of the reconnection loop in flight, if any.
    reconnecting: Mutex<Option<u64>>,
}

impl Client {
    /// Start building a client with an injected connector.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// A client that dials `config.url` over WebSocket.
    pub fn websocket(config: ClientConfig) -> WireResult<Self> {
        let connector = WebSocketConnector::from_config(&config)?;
        ClientBuilder::new(config).connector(connector).build()
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a connection is installed and open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Id of the current connection, if open.
    pub fn connection_id(&self) -> Option<Uuid> {
        self.inner.protocol().map(|p| p.connection_id())
    }

    /// Connect, closing any existing connection cleanly first.
    pub async fn open(&self) -> WireResult<()> {
        self.close().await;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Opening);
        match self.inner.connect_once(epoch, false).await {
            Ok(()) => {
                self.inner.events.emit(ClientEvent::Open);
                Ok(())
            }
            Err(e) => {
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    self.inner.set_state(ConnectionState::Closed);
                }
                warn!(url = %self.inner.config.url, error = %e, "Tether: connection failed");
                self.inner.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Close the connection with the normal code. Never reconnects.
    ///
    /// Also cancels a reconnection loop in flight. Closing a closed client
    /// does nothing.
    pub async fn close(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let live = self
            .inner
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.inner.set_state(ConnectionState::Closed);
        if let Some(live) = live {
            let code = live.handle.close(CloseCode::NORMAL).await;
            info!(
                connection = %live.handle.protocol().connection_id(),
                code = %code,
                "Tether: connection closed"
            );
            self.inner.events.emit(ClientEvent::Close { code });
        }
    }

    /// Write a message without waiting for a reply.
    pub fn post(&self, message: &Message) -> WireResult<()> {
        let protocol = self
            .inner
            .protocol()
            .ok_or_else(|| WireError::NotConnected {
                operation: message.operation().to_string(),
            })?;
        protocol.post(message)
    }

    /// Register a request handler for `operation`.
    pub fn on<F>(&self, operation: impl Into<String>, handler: F)
    where
        F: Fn(&InboundRequest) + Send + Sync + 'static,
    {
        self.inner.handlers.on(operation, handler);
    }

    /// Register a handler that sees every request.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&InboundRequest) + Send + Sync + 'static,
    {
        self.inner.handlers.on_any(handler);
    }

    /// Remove every handler for `operation`. Returns how many were removed.
    pub fn off(&self, operation: &str) -> usize {
        self.inner.handlers.off(operation)
    }

    /// Names of operations with a registered handler, sorted.
    pub fn operations(&self) -> Vec<String> {
        self.inner.handlers.operations()
    }

    /// Serve `operation` with an async function. See [`Handlers::handle`].
    pub fn handle<F, Fut, E>(&self, operation: impl Into<String>, function: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.inner.handlers.handle(operation, function);
    }

    /// Listen for one kind of lifecycle event.
    pub fn on_event<F>(&self, kind: ClientEventKind, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    /// Listen for every lifecycle event.
    pub fn on_any_event<F>(&self, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener);
    }

    /// Receive every lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }
}

#[async_trait]
impl Remote for Client {
    async fn send(&self, message: Message) -> WireResult<Reply> {
        let protocol = self
            .inner
            .protocol()
            .ok_or_else(|| WireError::NotConnected {
                operation: message.operation().to_string(),
            })?;
        protocol.send(message).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn protocol(&self) -> Option<Arc<Protocol>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current
            .as_ref()
            .map(|live| Arc::clone(live.handle.protocol()))
    }

    /// Open one transport and install it, unless `epoch` went stale meanwhile.
    ///
    /// `from_loop` hands the reconnection slot back while installing, so a
    /// connection that dies right away can start a fresh loop.
    async fn connect_once(self: &Arc<Self>, epoch: u64, from_loop: bool) -> WireResult<()> {
        let transport = self.connector.connect().await?;
        let (protocol, outbox) = Protocol::new(
            Arc::clone(&self.codec),
            Arc::clone(&self.handlers),
            self.config.request_timeout(),
        );
        let handle = connection::spawn(protocol, outbox, transport);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let installed = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            if self.epoch.load(Ordering::SeqCst) == epoch {
                *current = Some(Live {
                    generation,
                    handle: handle.clone(),
                });
                self.set_state(ConnectionState::Open);
                if from_loop {
                    self.release_loop(epoch);
                }
                true
            } else {
                false
            }
        };
        if !installed {
            debug!("Tether: discarding connection opened for a stale epoch");
            handle.close(CloseCode::NORMAL).await;
            return Err(WireError::ConnectionClosed);
        }

        info!(
            url = %self.config.url,
            connection = %handle.protocol().connection_id(),
            codec = self.codec.name(),
            "Tether: connected"
        );

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = handle.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_closed(generation, code, handle.closed_locally());
            }
        });
        Ok(())
    }

    /// Called once per connection when its transport ends.
    fn on_transport_closed(self: &Arc<Self>, generation: u64, code: CloseCode, local: bool) {
        let was_current = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|l| l.generation == generation) {
                *current = None;
                true
            } else {
                false
            }
        };
        // Replaced or closed explicitly; whoever did that reported it.
        if !was_current {
            return;
        }

        self.set_state(ConnectionState::Closed);
        info!(url = %self.config.url, code = %code, "Tether: connection closed");
        self.events.emit(ClientEvent::Close { code });

        if local || code.is_normal() || !self.config.auto_reconnect {
            return;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut running = self.reconnecting.lock().unwrap_or_else(|e| e.into_inner());
            if *running == Some(epoch) {
                return;
            }
            *running = Some(epoch);
        }
        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(reconnect(Arc::downgrade(self), epoch));
    }

    fn release_loop(&self, epoch: u64) {
        let mut running = self.reconnecting.lock().unwrap_or_else(|e| e.into_inner());
        if *running == Some(epoch) {
            *running = None;
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let current = self.current.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(live) = current.take() {
            live.handle.protocol().request_close(CloseCode::GOING_AWAY);
        }
    }
}

/// Reconnection loop: attempt now, then after each failure wait the next
/// backoff delay. Holds only a weak reference between attempts.
async fn reconnect(weak: Weak<ClientInner>, epoch: u64) {
    let (mut backoff, clock) = match weak.upgrade() {
        Some(inner) => (Backoff::from_config(&inner.config), Arc::clone(&inner.clock)),
        None => return,
    };

    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(epoch) {
            inner.release_loop(epoch);
            return;
        }

        let delay = match inner.connect_once(epoch, true).await {
            Ok(()) => {
                info!(
                    url = %inner.config.url,
                    attempts = backoff.attempts() + 1,
                    "Tether: reconnected"
                );
                inner.events.emit(ClientEvent::Open);
                inner.events.emit(ClientEvent::Reconnect);
                return;
            }
            Err(e) => {
                if !inner.is_current(epoch) {
                    inner.release_loop(epoch);
                    return;
                }
                let delay = backoff.next_delay();
                warn!(
                    url = %inner.config.url,
                    attempt = backoff.attempts(),
                    delay_ms = delay_ms(delay),
                    error = %e,
                    "Tether: reconnection attempt failed"
                );
                inner.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
                inner.events.emit(ClientEvent::Reconnecting {
                    attempt: backoff.attempts(),
                    delay,
                });
                delay
            }
        };

        drop(inner);
        clock.sleep(delay).await;
    }
}
