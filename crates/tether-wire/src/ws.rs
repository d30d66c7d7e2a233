//! WebSocket transport (tokio-tungstenite).
//!
//! Client side dials a `ws://` or `wss://` URL and offers the configured
//! subprotocols. Server side accepts TCP connections in a background task,
//! performs each upgrade in its own task (bounded by a handshake timeout)
//! and hands finished transports to [`Acceptor::accept`], so one slow
//! handshake never holds up the others.

use crate::error::{TransportError, WireError, WireResult};
use crate::transport::{
    Acceptor, CloseCode, Connector, FrameKind, Listener, PeerInfo, Transport, TransportEvent,
    TransportSink, TransportStream,
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tether_types::config::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};
use url::Url;

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Upper bound on a server-side upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Finished handshakes waiting for `accept`.
const ACCEPT_BACKLOG: usize = 64;

fn ws_config(max_message_size: Option<usize>) -> Option<WebSocketConfig> {
    max_message_size.map(|size| {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(size);
        config
    })
}

// ---------------------------------------------------------------------------
// Halves
// ---------------------------------------------------------------------------

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Vec<u8>, kind: FrameKind) -> Result<(), TransportError> {
        let message = match kind {
            FrameKind::Binary => WsMessage::Binary(frame),
            FrameKind::Text => WsMessage::Text(
                String::from_utf8(frame)
                    .map_err(|e| TransportError::WebSocket(format!("text frame is not UTF-8: {e}")))?,
            ),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        // Reserved codes must never appear in a close frame.
        let code = match code.0 {
            1005 | 1006 | 1015 => CloseCode::NORMAL,
            _ => code,
        };
        let frame = CloseFrame {
            code: WsCloseCode::from(code.0),
            reason: "".into(),
        };
        self.inner.send(WsMessage::Close(Some(frame))).await?;
        Ok(())
    }
}

struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
    finished: Option<CloseCode>,
}

#[async_trait]
impl<S> TransportStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next(&mut self) -> TransportEvent {
        if let Some(code) = self.finished {
            return TransportEvent::Closed(code);
        }
        loop {
            let code = match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => return TransportEvent::Frame(text.into_bytes()),
                Some(Ok(WsMessage::Binary(bytes))) => return TransportEvent::Frame(bytes),
                // Pings are answered by tungstenite itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(frame))) => frame
                    .map(|f| CloseCode(u16::from(f.code)))
                    .unwrap_or(CloseCode::NO_STATUS),
                Some(Err(e)) => {
                    debug!(error = %e, "Tether: websocket read failed");
                    CloseCode::ABNORMAL
                }
                None => CloseCode::ABNORMAL,
            };
            self.finished = Some(code);
            return TransportEvent::Closed(code);
        }
    }
}

fn split<S>(ws: WebSocketStream<S>, info: PeerInfo) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Transport {
        sink: Box::new(WsSink { inner: sink }),
        stream: Box::new(WsStream {
            inner: stream,
            finished: None,
        }),
        info,
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Dials a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    protocols: Vec<String>,
    max_message_size: Option<usize>,
}

impl WebSocketConnector {
    /// Parse and check `url`. Only `ws` and `wss` are accepted.
    pub fn new(url: &str) -> WireResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| WireError::Configuration(format!("invalid url '{url}': {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WireError::Configuration(format!(
                "url '{url}' must use the ws or wss scheme"
            )));
        }
        Ok(Self {
            url,
            protocols: Vec::new(),
            max_message_size: None,
        })
    }

    /// Build from a client's URL, subprotocols and message size limit.
    pub fn from_config(config: &ClientConfig) -> WireResult<Self> {
        Ok(Self::new(&config.url)?
            .with_protocols(config.protocols.clone())
            .with_max_message_size(config.max_message_size))
    }

    /// Subprotocols to offer, in preference order.
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Largest accepted inbound message. `None` keeps the tungstenite default.
    pub fn with_max_message_size(mut self, size: Option<usize>) -> Self {
        self.max_message_size = size;
        self
    }

    /// Endpoint this connector dials.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !self.protocols.is_empty() {
            let offered = HeaderValue::from_str(&self.protocols.join(", "))
                .map_err(|e| TransportError::Connect(format!("invalid subprotocol list: {e}")))?;
            request.headers_mut().insert(SUBPROTOCOL_HEADER, offered);
        }

        let (ws, response) = tokio_tungstenite::connect_async_with_config(
            request,
            ws_config(self.max_message_size),
            true,
        )
        .await
        .map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Io(io)
                if io.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                TransportError::Refused
            }
            tokio_tungstenite::tungstenite::Error::Io(io) => TransportError::Io(io),
            other => TransportError::Handshake(other.to_string()),
        })?;

        let protocol = response
            .headers()
            .get(SUBPROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let remote_addr = match ws.get_ref() {
            tokio_tungstenite::MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        let info = PeerInfo {
            remote_addr,
            path: Some(self.url.path().to_string()),
            protocol,
        };
        Ok(split(ws, info))
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Listens for WebSocket upgrades on a TCP address.
#[derive(Debug, Clone)]
pub struct WebSocketListener {
    addr: SocketAddr,
    protocols: Vec<String>,
    max_message_size: Option<usize>,
}

impl WebSocketListener {
    /// Listen on `addr` with no subprotocols.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocols: Vec::new(),
            max_message_size: None,
        }
    }

    /// Build from a server's address, subprotocols and message size limit.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.listen_addr)
            .with_protocols(config.protocols.clone())
            .with_max_message_size(config.max_message_size)
    }

    /// Subprotocols the server agrees to, in preference order.
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Largest accepted inbound message. `None` keeps the tungstenite default.
    pub fn with_max_message_size(mut self, size: Option<usize>) -> Self {
        self.max_message_size = size;
        self
    }
}

#[async_trait]
impl Listener for WebSocketListener {
    async fn bind(&self) -> Result<Box<dyn Acceptor>, TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let task = tokio::spawn(accept_loop(
            listener,
            tx,
            self.protocols.clone(),
            self.max_message_size,
        ));
        Ok(Box::new(WebSocketAcceptor {
            local_addr,
            rx,
            task,
        }))
    }
}

struct WebSocketAcceptor {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Transport>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Acceptor for WebSocketAcceptor {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn accept(&mut self) -> Result<Transport, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn drain(&mut self) -> Vec<Transport> {
        // Upgrades still in flight find the channel closed and close themselves.
        self.task.abort();
        self.rx.close();
        let mut queued = Vec::new();
        while let Ok(transport) = self.rx.try_recv() {
            queued.push(transport);
        }
        queued
    }
}

impl Drop for WebSocketAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Transport>,
    protocols: Vec<String>,
    max_message_size: Option<usize>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Tether: accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!(remote = %addr, "Tether: accepted tcp connection");

        let tx = tx.clone();
        let protocols = protocols.clone();
        tokio::spawn(async move {
            let upgrade = upgrade(stream, addr, &protocols, max_message_size);
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade).await {
                Ok(Ok(transport)) => {
                    if let Err(mpsc::error::SendError(transport)) = tx.send(transport).await {
                        debug!(remote = %addr, "Tether: listener gone, closing connection");
                        transport.close(CloseCode::NORMAL).await;
                    }
                }
                Ok(Err(e)) => warn!(remote = %addr, error = %e, "Tether: websocket handshake failed"),
                Err(_) => warn!(remote = %addr, "Tether: websocket handshake timed out"),
            }
        });
    }
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    protocols: &[String],
    max_message_size: Option<usize>,
) -> Result<Transport, TransportError> {
    let mut path = None;
    let mut chosen = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        path = Some(request.uri().path().to_string());
        chosen = select_protocol(
            request
                .headers()
                .get(SUBPROTOCOL_HEADER)
                .and_then(|v| v.to_str().ok()),
            protocols,
        );
        if let Some(protocol) = &chosen {
            if let Ok(value) = HeaderValue::from_str(protocol) {
                response.headers_mut().insert(SUBPROTOCOL_HEADER, value);
            }
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        ws_config(max_message_size),
    )
    .await
    .map_err(|e| TransportError::Handshake(e.to_string()))?;

    Ok(split(
        ws,
        PeerInfo {
            remote_addr: Some(addr),
            path,
            protocol: chosen,
        },
    ))
}

/// Pick the first of `supported` that the client offered.
fn select_protocol(offered: Option<&str>, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = offered?.split(',').map(str::trim).collect();
    supported
        .iter()
        .find(|candidate| offered.contains(&candidate.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_rejects_bad_urls() {
        assert!(matches!(
            WebSocketConnector::new("not a url"),
            Err(WireError::Configuration(_))
        ));
        assert!(matches!(
            WebSocketConnector::new("http://example.test/"),
            Err(WireError::Configuration(_))
        ));
        assert!(WebSocketConnector::new("wss://example.test/rpc").is_ok());
    }

    #[test]
    fn test_select_protocol_prefers_server_order() {
        let supported = vec!["tether.v2".to_string(), "tether.v1".to_string()];
        assert_eq!(
            select_protocol(Some("tether.v1, tether.v2"), &supported),
            Some("tether.v2".to_string())
        );
        assert_eq!(
            select_protocol(Some("tether.v1"), &supported),
            Some("tether.v1".to_string())
        );
        assert_eq!(select_protocol(Some("other"), &supported), None);
        assert_eq!(select_protocol(None, &supported), None);
    }

    #[tokio::test]
    async fn test_frames_and_close_over_loopback() {
        let listener = WebSocketListener::new("127.0.0.1:0".parse().unwrap())
            .with_protocols(vec!["tether".to_string()]);
        let mut acceptor = listener.bind().await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let connector = WebSocketConnector::new(&format!("ws://{addr}/rpc"))
            .unwrap()
            .with_protocols(vec!["tether".to_string()]);
        let mut client = connector.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        assert_eq!(client.info.protocol.as_deref(), Some("tether"));
        assert_eq!(server.info.path.as_deref(), Some("/rpc"));
        assert_eq!(server.info.protocol.as_deref(), Some("tether"));

        client.sink.send(vec![1, 2, 3], FrameKind::Binary).await.unwrap();
        assert_eq!(server.stream.next().await, TransportEvent::Frame(vec![1, 2, 3]));
        server.sink.send(b"{}".to_vec(), FrameKind::Text).await.unwrap();
        assert_eq!(client.stream.next().await, TransportEvent::Frame(b"{}".to_vec()));

        client.sink.close(CloseCode::NORMAL).await.unwrap();
        assert_eq!(server.stream.next().await, TransportEvent::Closed(CloseCode::NORMAL));
    }

    #[tokio::test]
    async fn test_unclaimed_connection_closed_normally_on_drain() {
        let listener = WebSocketListener::new("127.0.0.1:0".parse().unwrap());
        let mut acceptor = listener.bind().await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let mut client = WebSocketConnector::new(&format!("ws://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();

        // Whether or not the upgrade was queued yet, the client must see 1000.
        for transport in acceptor.drain().await {
            tokio::spawn(transport.close(CloseCode::NORMAL));
        }
        let event = tokio::time::timeout(Duration::from_secs(5), client.stream.next())
            .await
            .unwrap();
        assert_eq!(event, TransportEvent::Closed(CloseCode::NORMAL));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop to get a port nobody listens on.
        let addr = {
            let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            unused.local_addr().unwrap()
        };
        let connector = WebSocketConnector::new(&format!("ws://{addr}")).unwrap();
        assert!(connector.connect().await.is_err());
    }
}
