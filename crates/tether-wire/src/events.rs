//! Lifecycle events for clients and servers.
//!
//! An [`Emitter`] delivers each event three ways: to listeners registered
//! for its kind, to the explicit any-listeners, and to every broadcast
//! subscriber. Listeners run synchronously on the emitting task and must
//! not block.

use crate::server::Peer;
use crate::transport::CloseCode;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of each emitter's broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// An event with a cheap discriminant to route on.
pub trait Event: Clone + Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Typed event dispatcher.
pub struct Emitter<E: Event> {
    listeners: RwLock<HashMap<E::Kind, Vec<Listener<E>>>>,
    any: RwLock<Vec<Listener<E>>>,
    sender: broadcast::Sender<E>,
}

impl<E: Event> Emitter<E> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            listeners: RwLock::new(HashMap::new()),
            any: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Listen for one kind of event.
    pub fn on<F>(&self, kind: E::Kind, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(kind).or_default().push(Arc::new(listener));
    }

    /// Listen for every event.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut any = self.any.write().unwrap_or_else(|e| e.into_inner());
        any.push(Arc::new(listener));
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Run the matching listeners, then publish to subscribers.
    pub fn emit(&self, event: E) {
        let specific = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.get(&event.kind()).cloned().unwrap_or_default()
        };
        let any = self.any.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in specific.iter().chain(any.iter()) {
            listener(&event);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Client lifecycle events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection opened.
    Open,
    /// The connection closed with this status.
    Close { code: CloseCode },
    /// Opening the connection failed.
    Error { message: String },
    /// A reconnection attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnection succeeded.
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Open,
    Close,
    Error,
    Reconnecting,
    Reconnect,
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            Self::Open => ClientEventKind::Open,
            Self::Close { .. } => ClientEventKind::Close,
            Self::Error { .. } => ClientEventKind::Error,
            Self::Reconnecting { .. } => ClientEventKind::Reconnecting,
            Self::Reconnect => ClientEventKind::Reconnect,
        }
    }
}

/// Server lifecycle events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The server is listening.
    Listening { addr: Option<SocketAddr> },
    /// A peer connected.
    Connection { peer: Peer },
    /// A peer disconnected.
    ClientClose { peer: Peer, code: CloseCode },
    /// The server itself shut down.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Listening,
    Connection,
    ClientClose,
    Close,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Listening { .. } => ServerEventKind::Listening,
            Self::Connection { .. } => ServerEventKind::Connection,
            Self::ClientClose { .. } => ServerEventKind::ClientClose,
            Self::Close => ServerEventKind::Close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_kind_listeners_and_any() {
        let emitter: Emitter<ClientEvent> = Emitter::new();
        let opens = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let o = Arc::clone(&opens);
        emitter.on(ClientEventKind::Open, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        });
        let a = Arc::clone(&all);
        emitter.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(ClientEvent::Open);
        emitter.emit(ClientEvent::Close {
            code: CloseCode::NORMAL,
        });
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let emitter: Emitter<ServerEvent> = Emitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(ServerEvent::Listening { addr: None });
        emitter.emit(ServerEvent::Close);
        assert_eq!(rx.recv().await.unwrap().kind(), ServerEventKind::Listening);
        assert_eq!(rx.recv().await.unwrap().kind(), ServerEventKind::Close);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter: Emitter<ClientEvent> = Emitter::default();
        emitter.emit(ClientEvent::Reconnect);
    }
}
