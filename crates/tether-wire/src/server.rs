//! Server lifecycle.
//!
//! A [`Server`] binds an injected [`Listener`], wraps every accepted
//! transport in its own protocol engine ([`Peer`]), and keeps the live set in
//! a [`PeerRegistry`]. Request handlers registered on the server serve every
//! peer; a handler finds out which peer called through
//! [`InboundRequest::connection_id`], which equals the peer's id.

use crate::codec::{codec_for, Codec};
use crate::connection::{self, ConnectionHandle};
use crate::error::{TransportError, WireError, WireResult};
use crate::events::{Emitter, ServerEvent, ServerEventKind};
use crate::handlers::Handlers;
use crate::protocol::{InboundRequest, Protocol, Reply};
use crate::proxy::Remote;
use crate::registry::PeerRegistry;
use crate::transport::{Acceptor, CloseCode, Listener, PeerInfo, Transport};
use crate::ws::WebSocketListener;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_types::config::ServerConfig;
use tether_types::Message;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies one server-side connection.
pub type PeerId = Uuid;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One connected client, as seen by the server.
///
/// Cloning is cheap; clones refer to the same connection. Peers compare
/// equal by id.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    info: PeerInfo,
    connected_at: DateTime<Utc>,
    handle: ConnectionHandle,
}

impl Peer {
    pub(crate) fn new(info: PeerInfo, handle: ConnectionHandle) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                info,
                connected_at: Utc::now(),
                handle,
            }),
        }
    }

    /// Peer id, equal to its connection id.
    pub fn id(&self) -> PeerId {
        self.inner.handle.protocol().connection_id()
    }

    /// Address, request path and subprotocol of the connection.
    pub fn info(&self) -> &PeerInfo {
        &self.inner.info
    }

    /// When the connection was admitted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.inner.handle.is_closed()
    }

    /// Protocol engine serving this peer.
    pub fn protocol(&self) -> &Arc<Protocol> {
        self.inner.handle.protocol()
    }

    /// Write a message to this peer without waiting for a reply.
    pub fn post(&self, message: &Message) -> WireResult<()> {
        self.protocol().post(message)
    }

    /// Close this peer's connection with the normal code.
    pub async fn close(&self) -> CloseCode {
        self.inner.handle.close(CloseCode::NORMAL).await
    }

    /// Wait until this peer's connection ends.
    pub async fn closed(&self) -> CloseCode {
        self.inner.handle.closed().await
    }
}

#[async_trait]
impl Remote for Peer {
    async fn send(&self, message: Message) -> WireResult<Reply> {
        self.protocol().send(message).await
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("remote_addr", &self.inner.info.remote_addr)
            .field("connected_at", &self.inner.connected_at)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Builds a [`Server`] from configuration and an injected listener.
pub struct ServerBuilder {
    config: ServerConfig,
    listener: Option<Arc<dyn Listener>>,
    codec: Option<Arc<dyn Codec>>,
}

impl ServerBuilder {
    /// Start a builder with no listener and the codec named in `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listener: None,
            codec: None,
        }
    }

    /// The transport listener. Required.
    pub fn listener(mut self, listener: impl Listener) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Override the codec chosen by `config.codec`.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Validate the configuration and assemble the server.
    pub fn build(self) -> WireResult<Server> {
        self.config.validate().map_err(WireError::Configuration)?;
        let listener = self.listener.ok_or_else(|| {
            WireError::Configuration("No transport listener was supplied".to_string())
        })?;
        let codec = self.codec.unwrap_or_else(|| codec_for(self.config.codec));
        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                listener,
                codec,
                handlers: Arc::new(Handlers::new()),
                events: Emitter::new(),
                peers: PeerRegistry::new(),
                running: Mutex::new(None),
            }),
        })
    }
}

/// The server endpoint.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    listener: Arc<dyn Listener>,
    codec: Arc<dyn Codec>,
    handlers: Arc<Handlers>,
    events: Emitter<ServerEvent>,
    peers: PeerRegistry,
    /// Set while listening. The lock also serializes `open` and `close`.
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: Option<SocketAddr>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    /// Start building a server with an injected listener.
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// A server listening for WebSocket upgrades on `config.listen_addr`.
    pub fn websocket(config: ServerConfig) -> WireResult<Self> {
        let listener = WebSocketListener::from_config(&config);
        ServerBuilder::new(config).listener(listener).build()
    }

    /// Settings this server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Start listening. Resolves with the bound address once listening.
    ///
    /// Opening an open server returns the existing address.
    pub async fn open(&self) -> WireResult<Option<SocketAddr>> {
        let mut running = self.inner.running.lock().await;
        if let Some(existing) = running.as_ref() {
            return Ok(existing.local_addr);
        }

        let acceptor = self.inner.listener.bind().await?;
        let local_addr = acceptor.local_addr();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            acceptor,
            shutdown_rx,
        ));
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        drop(running);

        info!(addr = ?local_addr, codec = self.inner.codec.name(), "Tether: server listening");
        self.inner
            .events
            .emit(ServerEvent::Listening { addr: local_addr });
        Ok(local_addr)
    }

    /// Stop listening and close every peer with the normal code.
    ///
    /// Emits `ClientClose` for each peer, then `Close`. Closing a server
    /// that is not open does nothing.
    pub async fn close(&self) {
        let mut running = self.inner.running.lock().await;
        let Some(current) = running.take() else {
            return;
        };
        let _ = current.shutdown.send(());
        if let Err(e) = current.task.await {
            warn!(error = %e, "Tether: accept loop ended abnormally");
        }

        let peers = self.inner.peers.drain();
        let codes = join_all(peers.iter().map(|peer| peer.close())).await;
        for (peer, code) in peers.into_iter().zip(codes) {
            self.inner
                .events
                .emit(ServerEvent::ClientClose { peer, code });
        }
        drop(running);

        info!("Tether: server closed");
        self.inner.events.emit(ServerEvent::Close);
    }

    /// Whether `open` succeeded and `close` has not run since.
    pub async fn is_listening(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.local_addr)
    }

    /// Send `message` to every live peer at once.
    ///
    /// Each peer gets its own entry; one peer failing or leaving only fails
    /// its own entry. The same id is used on every connection, which is
    /// safe because correlation is per connection.
    pub async fn broadcast(&self, message: Message) -> HashMap<PeerId, WireResult<Reply>> {
        let peers = self.inner.peers.snapshot();
        let sends = peers.into_iter().map(|peer| {
            let message = message.clone();
            async move {
                let result = peer.send(message).await;
                (peer.id(), result)
            }
        });
        join_all(sends).await.into_iter().collect()
    }

    /// Live peers, oldest first.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.snapshot()
    }

    /// Look up a live peer by id.
    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        self.inner.peers.get(id)
    }

    /// Number of live peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.count()
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
    pub fn on_event<F>(&self, kind: ServerEventKind, listener: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    /// Listen for every lifecycle event.
    pub fn on_any_event<F>(&self, listener: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener);
    }

    /// Receive every lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl ServerInner {
    /// Wrap an accepted transport and add it to the live set.
    fn admit(self: &Arc<Self>, transport: Transport) {
        let info = transport.info.clone();
        let (protocol, outbox) = Protocol::new(
            Arc::clone(&self.codec),
            Arc::clone(&self.handlers),
            self.config.request_timeout(),
        );
        let (handle, driver) = connection::prepare(protocol, outbox, transport);
        let peer = Peer::new(info, handle);

        self.peers.add(peer.clone());
        info!(
            peer = %peer.id(),
            remote = ?peer.info().remote_addr,
            peers = self.peers.count(),
            "Tether: peer connected"
        );
        self.events.emit(ServerEvent::Connection { peer: peer.clone() });
        tokio::spawn(driver);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = peer.closed().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Absent means the server shut down and reported it already.
            if inner.peers.remove(peer.id()).is_some() {
                info!(peer = %peer.id(), code = %code, "Tether: peer disconnected");
                inner.events.emit(ServerEvent::ClientClose { peer, code });
            }
        });
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        for peer in self.peers.drain() {
            peer.protocol().request_close(CloseCode::GOING_AWAY);
        }
    }
}

async fn accept_loop(
    server: Weak<ServerInner>,
    mut acceptor: Box<dyn Acceptor>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let code = loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break CloseCode::NORMAL,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(transport) => match server.upgrade() {
                Some(inner) => inner.admit(transport),
                None => {
                    transport.close(CloseCode::GOING_AWAY).await;
                    break CloseCode::GOING_AWAY;
                }
            },
            Err(TransportError::Closed) => {
                warn!("Tether: listener closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "Tether: accept error");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    };

    // Connections established but never admitted still get a proper close.
    let unclaimed = acceptor.drain().await;
    if !unclaimed.is_empty() {
        debug!(count = unclaimed.len(), code = %code, "Tether: closing unclaimed connections");
        join_all(unclaimed.into_iter().map(|t| t.close(code))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::events::{ClientEvent, Event};
    use crate::memory::MemoryHub;
    use tether_types::config::ClientConfig;

    fn memory_server(hub: &MemoryHub) -> Server {
        Server::builder(ServerConfig::default())
            .listener(hub.listener())
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_without_listener_fails() {
        let err = Server::builder(ServerConfig::default()).build().unwrap_err();
        assert!(matches!(err, WireError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_close_is_noop_twice() {
        let hub = MemoryHub::new();
        let server = memory_server(&hub);
        let mut events = server.subscribe();

        server.open().await.unwrap();
        server.open().await.unwrap();
        assert!(server.is_listening().await);
        assert!(hub.is_listening());

        server.close().await;
        server.close().await;
        assert!(!server.is_listening().await);
        assert!(!hub.is_listening());

        assert_eq!(events.recv().await.unwrap().kind(), ServerEventKind::Listening);
        assert_eq!(events.recv().await.unwrap().kind(), ServerEventKind::Close);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let hub = MemoryHub::new();
        let server = memory_server(&hub);
        server.open().await.unwrap();
        server.close().await;
        server.open().await.unwrap();
        assert!(hub.is_listening());
        server.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let hub = MemoryHub::new();
        let server = memory_server(&hub);
        server.open().await.unwrap();
        let results = server.broadcast(Message::request("ping", vec![])).await;
        assert!(results.is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_right_after_connect_is_normal_for_client() {
        let hub = MemoryHub::new();
        let server = memory_server(&hub);
        for _ in 0..50 {
            server.open().await.unwrap();
            let client = Client::builder(ClientConfig::default())
                .connector(hub.connector())
                .build()
                .unwrap();
            let mut events = client.subscribe();
            client.open().await.unwrap();
            server.close().await;

            let code = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Ok(ClientEvent::Close { code }) = events.recv().await {
                        return code;
                    }
                }
            })
            .await
            .expect("client never saw the close");
            assert_eq!(code, CloseCode::NORMAL);
            assert!(!client.is_open());
            client.close().await;
        }
    }
}
