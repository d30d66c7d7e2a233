//! Request handler registry.
//!
//! Handlers are registered per operation name, plus an explicit "any" list
//! that sees every inbound request. All matching handlers run, in
//! registration order; none suppresses another.

use crate::protocol::InboundRequest;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::warn;

type Handler = Arc<dyn Fn(&InboundRequest) + Send + Sync>;

/// Registry of request handlers, shared by every connection of an endpoint.
#[derive(Default)]
pub struct Handlers {
    operations: RwLock<HashMap<String, Vec<Handler>>>,
    any: RwLock<Vec<Handler>>,
}

impl Handlers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one operation.
    pub fn on<F>(&self, operation: impl Into<String>, handler: F)
    where
        F: Fn(&InboundRequest) + Send + Sync + 'static,
    {
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations
            .entry(operation.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler that sees every request.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&InboundRequest) + Send + Sync + 'static,
    {
        let mut any = self.any.write().unwrap_or_else(|e| e.into_inner());
        any.push(Arc::new(handler));
    }

    /// Remove every handler for `operation`. Returns how many were removed.
    pub fn off(&self, operation: &str) -> usize {
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations.remove(operation).map_or(0, |list| list.len())
    }

    /// Serve `operation` with an async function of its arguments.
    ///
    /// The function's value becomes the single reply argument; an error is
    /// sent back as an error record. The acknowledgement is not awaited.
    pub fn handle<F, Fut, E>(&self, operation: impl Into<String>, function: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.on(operation, move |request: &InboundRequest| {
            let outcome = function(request.arguments().to_vec());
            let request = request.clone();
            tokio::spawn(async move {
                let sent = match outcome.await {
                    Ok(value) => request.reply(vec![value]),
                    Err(err) => {
                        let err: Box<dyn std::error::Error + Send + Sync> = err.into();
                        request.reply_error(&*err)
                    }
                };
                if let Err(e) = sent {
                    warn!(
                        operation = %request.operation(),
                        id = %request.id(),
                        error = %e,
                        "Tether: failed to send reply"
                    );
                }
            });
        });
    }

    /// Names of operations with at least one handler.
    pub fn operations(&self) -> Vec<String> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = operations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run every handler matching the request. Returns how many ran.
    pub fn dispatch(&self, request: &InboundRequest) -> usize {
        // Snapshot first so a handler may register further handlers.
        let exact = {
            let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
            operations
                .get(request.operation())
                .cloned()
                .unwrap_or_default()
        };
        let any = self.any.read().unwrap_or_else(|e| e.into_inner()).clone();

        for handler in exact.iter().chain(any.iter()) {
            handler(request);
        }
        exact.len() + any.len()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let any = self.any.read().unwrap_or_else(|e| e.into_inner()).len();
        f.debug_struct("Handlers")
            .field("operations", &self.operations())
            .field("any", &any)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, JsonCodec};
    use crate::protocol::{Outbound, Protocol};
    use serde_json::json;
    use std::sync::Mutex;
    use tether_types::{ErrorRecord, InstructionKind, Message};
    use tokio::sync::mpsc;

    fn feed(handlers: Arc<Handlers>, request: &Message) -> mpsc::UnboundedReceiver<Outbound> {
        let (protocol, rx) = Protocol::new(Arc::new(JsonCodec), handlers, None);
        protocol.read(&JsonCodec.encode(request).unwrap()).unwrap();
        rx
    }

    async fn next_written(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Message {
        match rx.recv().await.expect("queue closed") {
            Outbound::Frame { bytes, .. } => JsonCodec.decode(&bytes).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_handlers_run_in_order() {
        let handlers = Arc::new(Handlers::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            handlers.on("ping", move |_: &InboundRequest| seen.lock().unwrap().push(tag));
        }
        let any_seen = Arc::clone(&seen);
        handlers.on_any(move |request: &InboundRequest| {
            any_seen.lock().unwrap().push("any");
            assert_eq!(request.operation(), "ping");
        });

        let _rx = feed(Arc::clone(&handlers), &Message::request("ping", vec![]));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "any"]);
    }

    #[tokio::test]
    async fn test_off_removes_operation() {
        let handlers = Handlers::new();
        handlers.on("a", |_: &InboundRequest| {});
        handlers.on("a", |_: &InboundRequest| {});
        handlers.on("b", |_: &InboundRequest| {});
        assert_eq!(handlers.operations(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(handlers.off("a"), 2);
        assert_eq!(handlers.off("a"), 0);
        assert_eq!(handlers.operations(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_replies_with_value() {
        let handlers = Arc::new(Handlers::new());
        handlers.handle("add", |args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok::<_, std::io::Error>(json!(sum))
        });

        let request = Message::request("add", vec![json!(1), json!(2), json!(3)]);
        let mut rx = feed(handlers, &request);
        let reply = next_written(&mut rx).await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.kind(), InstructionKind::Reply);
        assert_eq!(reply.arguments(), &[json!(6)]);
    }

    #[tokio::test]
    async fn test_handle_replies_with_error_record() {
        let handlers = Arc::new(Handlers::new());
        handlers.handle("fail", |_args: Vec<Value>| async move {
            Err::<Value, _>("boom")
        });

        let mut rx = feed(handlers, &Message::request("fail", vec![]));
        let reply = next_written(&mut rx).await;
        let record = ErrorRecord::detect(&reply.arguments()[0]).expect("error record");
        assert_eq!(record.message, "boom");
    }
}
