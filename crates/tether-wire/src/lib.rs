//! Tether wire protocol: bidirectional RPC over a duplex message transport.
//!
//! Either endpoint can invoke a named operation on the other and receive a
//! single reply. Every exchange is a `REQUEST`, its `REPLY`, and a terminal
//! `REPLY_TO_REPLY` acknowledgement, correlated by id.
//!
//! ## Architecture
//!
//! - **Codec**: envelope encode/decode (JSON or MessagePack)
//! - **Transport**: injected connectors and listeners (WebSocket, in-process)
//! - **Protocol**: per-connection correlation engine and request routing
//! - **Invoke**: named remote calls on anything that implements `Remote`
//! - **Client**: one connection with automatic reconnection and backoff
//! - **Server**: many peers, lifecycle events and broadcast

pub mod backoff;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod handlers;
pub mod memory;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;
pub mod ws;

pub use backoff::{Backoff, Clock, TokioClock};
pub use client::{Client, ClientBuilder, ConnectionState};
pub use codec::{codec_for, Codec, JsonCodec, MessagePackCodec};
pub use error::{TransportError, WireError, WireResult};
pub use events::{ClientEvent, ClientEventKind, ServerEvent, ServerEventKind};
pub use handlers::Handlers;
pub use memory::MemoryHub;
pub use protocol::{InboundRequest, PendingReply, Protocol, Reply};
pub use proxy::{Invoke, Remote};
pub use registry::PeerRegistry;
pub use server::{Peer, PeerId, Server, ServerBuilder};
pub use transport::{CloseCode, Connector, Listener, PeerInfo, Transport};
pub use ws::{WebSocketConnector, WebSocketListener};

pub use tether_types::config::{ClientConfig, CodecKind, ServerConfig};
pub use tether_types::{ErrorRecord, Message, RemoteError};
