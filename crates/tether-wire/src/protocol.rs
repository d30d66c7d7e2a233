//! Protocol engine: one per connection.
//!
//! The engine owns the pending-request table and the write queue of a single
//! transport connection. Outgoing requests are registered under their id
//! before they are written; inbound replies settle exactly the entry with the
//! matching id; inbound requests are handed to the [`Handlers`] registry
//! together with a capability to answer them.
//!
//! The engine never touches the transport directly. It queues [`Outbound`]
//! items that the connection driver (see [`crate::connection`]) writes in
//! order, and the driver feeds it inbound frames through [`Protocol::read`].

use crate::codec::Codec;
use crate::error::{WireError, WireResult};
use crate::handlers::Handlers;
use crate::transport::{CloseCode, FrameKind};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tether_types::{ErrorRecord, InstructionKind, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// An item queued for the connection driver.
#[derive(Debug)]
pub enum Outbound {
    /// An encoded envelope.
    Frame { bytes: Vec<u8>, kind: FrameKind },
    /// Start the closing handshake.
    Close(CloseCode),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Correlation engine for one connection.
pub struct Protocol {
    connection_id: Uuid,
    codec: Arc<dyn Codec>,
    handlers: Arc<Handlers>,
    outbox: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    /// Cleared by `shutdown`, always while `pending` is locked.
    open: AtomicBool,
    request_timeout: Option<Duration>,
}

impl Protocol {
    /// Create an engine and the receiving end of its write queue.
    pub fn new(
        codec: Arc<dyn Codec>,
        handlers: Arc<Handlers>,
        request_timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            codec,
            handlers,
            outbox,
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            request_timeout,
        });
        (protocol, rx)
    }

    /// Identifier of the connection this engine serves.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// False once the connection has shut down.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Register `message` and queue it for writing.
    ///
    /// The returned [`PendingReply`] resolves with the correlated reply.
    /// Dropping it before it resolves removes the table entry.
    pub fn dispatch(self: &Arc<Self>, message: Message) -> WireResult<PendingReply> {
        if !message.kind().expects_reply() {
            return Err(WireError::Unanswerable { id: message.id });
        }
        let bytes = self.codec.encode(&message)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_open() {
                return Err(WireError::NotConnected {
                    operation: message.instruction.operation,
                });
            }
            if pending.contains_key(&message.id) {
                return Err(WireError::DuplicateId(message.id));
            }
            pending.insert(message.id.clone(), tx);
        }

        let frame = Outbound::Frame {
            bytes,
            kind: self.codec.frame_kind(),
        };
        if self.outbox.send(frame).is_err() {
            self.forget(&message.id);
            return Err(WireError::NotConnected {
                operation: message.instruction.operation,
            });
        }
        debug!(
            connection = %self.connection_id,
            id = %message.id,
            operation = %message.operation(),
            kind = %message.kind(),
            "Tether: sent"
        );

        Ok(PendingReply {
            id: message.id,
            rx,
            protocol: Arc::downgrade(self),
            settled: false,
        })
    }

    /// Send `message` and wait for its reply.
    ///
    /// Waits forever unless the engine was built with a request timeout.
    pub async fn send(self: &Arc<Self>, message: Message) -> WireResult<Reply> {
        let operation = message.operation().to_string();
        let pending = self.dispatch(message)?;
        let message = match self.request_timeout {
            Some(after) => tokio::time::timeout(after, pending)
                .await
                .map_err(|_| WireError::Timeout { operation, after })??,
            None => pending.await?,
        };
        Ok(Reply {
            message,
            protocol: Arc::clone(self),
        })
    }

    /// Queue `message` without waiting for a reply.
    pub fn post(&self, message: &Message) -> WireResult<()> {
        let not_connected = || WireError::NotConnected {
            operation: message.operation().to_string(),
        };
        if !self.is_open() {
            return Err(not_connected());
        }
        let bytes = self.codec.encode(message)?;
        self.outbox
            .send(Outbound::Frame {
                bytes,
                kind: self.codec.frame_kind(),
            })
            .map_err(|_| not_connected())?;
        debug!(
            connection = %self.connection_id,
            id = %message.id,
            kind = %message.kind(),
            "Tether: posted"
        );
        Ok(())
    }

    /// Handle one inbound frame.
    ///
    /// Requests go to the handlers, replies settle their pending entry and
    /// are never routed. A malformed frame is returned as `Decode` and
    /// leaves the engine untouched.
    pub fn read(self: &Arc<Self>, bytes: &[u8]) -> WireResult<()> {
        let message = self.codec.decode(bytes)?;
        match message.kind() {
            InstructionKind::Request => {
                let request = InboundRequest {
                    message,
                    protocol: Arc::clone(self),
                };
                let handled = self.handlers.dispatch(&request);
                debug!(
                    connection = %self.connection_id,
                    id = %request.id(),
                    operation = %request.operation(),
                    handlers = handled,
                    "Tether: request received"
                );
            }
            InstructionKind::Reply | InstructionKind::ReplyToReply => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&message.id);
                match waiter {
                    Some(tx) => {
                        let id = message.id.clone();
                        if tx.send(message).is_err() {
                            debug!(connection = %self.connection_id, id = %id, "Tether: reply arrived after its caller gave up");
                        }
                    }
                    None => {
                        debug!(
                            connection = %self.connection_id,
                            id = %message.id,
                            kind = %message.kind(),
                            "Tether: no pending request for reply"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask the driver to close the connection. Returns false if it is already gone.
    pub fn request_close(&self, code: CloseCode) -> bool {
        self.outbox.send(Outbound::Close(code)).is_ok()
    }

    /// Stop accepting sends and fail every pending request with `ConnectionClosed`.
    ///
    /// Returns the number of requests that were abandoned.
    pub fn shutdown(&self) -> usize {
        let abandoned: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            self.open.store(false, Ordering::SeqCst);
            pending.drain().collect()
        };
        if !abandoned.is_empty() {
            debug!(
                connection = %self.connection_id,
                abandoned = abandoned.len(),
                "Tether: rejecting pending requests"
            );
        }
        abandoned.len()
    }

    /// Remove an entry whose waiter is gone.
    fn forget(&self, id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.get(id).is_some_and(|tx| tx.is_closed()) {
            pending.remove(id);
        }
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("connection_id", &self.connection_id)
            .field("codec", &self.codec.name())
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pending replies
// ---------------------------------------------------------------------------

/// A registered request waiting for its reply.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Message>,
    protocol: Weak<Protocol>,
    settled: bool,
}

impl PendingReply {
    /// Correlation id being waited on.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = WireResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(message)) => Ok(message),
            Poll::Ready(Err(_)) => Err(WireError::ConnectionClosed),
            Poll::Pending => return Poll::Pending,
        };
        self.settled = true;
        Poll::Ready(result)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Some(protocol) = self.protocol.upgrade() {
            protocol.forget(&self.id);
        }
    }
}

/// A correlated reply, with the capability to acknowledge it.
#[derive(Debug, Clone)]
pub struct Reply {
    message: Message,
    protocol: Arc<Protocol>,
}

impl Reply {
    /// The reply envelope.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Arguments carried by the reply.
    pub fn arguments(&self) -> &[Value] {
        self.message.arguments()
    }

    /// Take the reply envelope.
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Take the reply's arguments.
    pub fn into_arguments(self) -> Vec<Value> {
        self.message.instruction.arguments
    }

    /// Answer this reply with a terminal `REPLY_TO_REPLY`.
    pub fn reply(&self, arguments: Vec<Value>) -> WireResult<()> {
        let ack = self.message.make_reply(arguments)?;
        self.protocol.post(&ack)
    }

    /// Send the empty acknowledgement.
    pub fn acknowledge(&self) -> WireResult<()> {
        self.reply(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

/// A request received from the peer, handed to every matching handler.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    message: Message,
    protocol: Arc<Protocol>,
}

impl InboundRequest {
    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// Requested operation name.
    pub fn operation(&self) -> &str {
        self.message.operation()
    }

    /// Arguments of the request.
    pub fn arguments(&self) -> &[Value] {
        self.message.arguments()
    }

    /// The request envelope.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Connection the request arrived on. Matches the server's peer id.
    pub fn connection_id(&self) -> Uuid {
        self.protocol.connection_id()
    }

    /// Answer with a `REPLY`.
    ///
    /// The returned future resolves with the caller's acknowledgement; it
    /// can simply be dropped when the acknowledgement does not matter.
    pub fn reply(&self, arguments: Vec<Value>) -> WireResult<PendingReply> {
        let reply = self.message.make_reply(arguments)?;
        self.protocol.dispatch(reply)
    }

    /// Answer with the error record for `err`.
    pub fn reply_error(&self, err: &(dyn std::error::Error + 'static)) -> WireResult<PendingReply> {
        self.reply(vec![ErrorRecord::from_error(err).into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    fn engine() -> (Arc<Protocol>, mpsc::UnboundedReceiver<Outbound>) {
        Protocol::new(Arc::new(JsonCodec), Arc::new(Handlers::new()), None)
    }

    fn written(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Message {
        match rx.try_recv().expect("nothing queued") {
            Outbound::Frame { bytes, kind } => {
                assert_eq!(kind, FrameKind::Text);
                JsonCodec.decode(&bytes).unwrap()
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn encode(message: &Message) -> Vec<u8> {
        JsonCodec.encode(message).unwrap()
    }

    #[tokio::test]
    async fn test_reply_settles_matching_request() {
        let (protocol, mut rx) = engine();
        let request = Message::request("multiply", vec![json!(2), json!(3)]);
        let pending = protocol.dispatch(request.clone()).unwrap();
        assert_eq!(protocol.pending_count(), 1);
        assert_eq!(written(&mut rx), request);

        let reply = request.make_reply(vec![json!(6)]).unwrap();
        protocol.read(&encode(&reply)).unwrap();
        assert_eq!(pending.await.unwrap(), reply);
        assert_eq!(protocol.pending_count(), 0);
    }

    #[test]
    fn test_pending_stays_unsettled_until_reply() {
        let (protocol, _rx) = engine();
        let request = Message::request("later", vec![]);
        let mut pending = tokio_test::task::spawn(protocol.dispatch(request.clone()).unwrap());
        tokio_test::assert_pending!(pending.poll());

        let reply = request.make_reply(vec![json!(1)]).unwrap();
        protocol.read(&encode(&reply)).unwrap();
        assert!(pending.is_woken());
        let settled = tokio_test::assert_ready!(pending.poll());
        assert_eq!(settled.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (protocol, _rx) = engine();
        let first = Message::request("a", vec![]);
        let second = Message::request("b", vec![]);
        let p1 = protocol.dispatch(first.clone()).unwrap();
        let p2 = protocol.dispatch(second.clone()).unwrap();

        protocol
            .read(&encode(&second.make_reply(vec![json!("b")]).unwrap()))
            .unwrap();
        protocol
            .read(&encode(&first.make_reply(vec![json!("a")]).unwrap()))
            .unwrap();

        assert_eq!(p1.await.unwrap().arguments(), &[json!("a")]);
        assert_eq!(p2.await.unwrap().arguments(), &[json!("b")]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (protocol, _rx) = engine();
        let request = Message::request("x", vec![]);
        let _pending = protocol.dispatch(request.clone()).unwrap();
        let err = protocol.dispatch(request).unwrap_err();
        assert!(matches!(err, WireError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_terminal_message_is_unanswerable() {
        let (protocol, _rx) = engine();
        let request = Message::request("x", vec![]);
        let ack = request
            .make_reply(vec![])
            .unwrap()
            .make_reply(vec![])
            .unwrap();
        assert!(matches!(
            protocol.dispatch(ack),
            Err(WireError::Unanswerable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let (protocol, _rx) = engine();
        let stray = Message::request("x", vec![]).make_reply(vec![]).unwrap();
        assert!(protocol.read(&encode(&stray)).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_decode_error() {
        let (protocol, _rx) = engine();
        assert!(matches!(
            protocol.read(b"{\"id\": 1"),
            Err(WireError::Decode(_))
        ));
        assert!(protocol.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_later_sends() {
        let (protocol, _rx) = engine();
        let pending = protocol.dispatch(Message::request("slow", vec![])).unwrap();
        assert_eq!(protocol.shutdown(), 1);
        assert!(matches!(pending.await, Err(WireError::ConnectionClosed)));

        let err = protocol
            .dispatch(Message::request("late", vec![]))
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected { operation } if operation == "late"));
    }

    #[tokio::test]
    async fn test_dropping_pending_removes_entry() {
        let (protocol, _rx) = engine();
        let pending = protocol.dispatch(Message::request("x", vec![])).unwrap();
        assert_eq!(protocol.pending_count(), 1);
        drop(pending);
        assert_eq!(protocol.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let (protocol, _rx) = Protocol::new(
            Arc::new(JsonCodec),
            Arc::new(Handlers::new()),
            Some(Duration::from_millis(20)),
        );
        let err = protocol
            .send(Message::request("never", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout { ref operation, .. } if operation == "never"));
        assert_eq!(protocol.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_routed_with_reply_capability() {
        let handlers = Arc::new(Handlers::new());
        handlers.on("double", |request: &InboundRequest| {
            let n = request.arguments()[0].as_i64().unwrap();
            let _ = request.reply(vec![json!(n * 2)]);
        });
        let (protocol, mut rx) = Protocol::new(Arc::new(JsonCodec), handlers, None);

        let request = Message::request("double", vec![json!(21)]);
        protocol.read(&encode(&request)).unwrap();

        let reply = written(&mut rx);
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.kind(), InstructionKind::Reply);
        assert_eq!(reply.arguments(), &[json!(42)]);
    }

    #[tokio::test]
    async fn test_reply_acknowledge_is_posted() {
        let (protocol, mut rx) = engine();
        let request = Message::request("x", vec![]);
        let pending = protocol.dispatch(request.clone()).unwrap();
        let _ = written(&mut rx);

        protocol
            .read(&encode(&request.make_reply(vec![json!(1)]).unwrap()))
            .unwrap();
        let reply = Reply {
            message: pending.await.unwrap(),
            protocol: Arc::clone(&protocol),
        };
        reply.acknowledge().unwrap();

        let ack = written(&mut rx);
        assert_eq!(ack.kind(), InstructionKind::ReplyToReply);
        assert_eq!(ack.id, request.id);
        assert_eq!(protocol.pending_count(), 0);
    }
}
