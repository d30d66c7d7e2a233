//! Call proxy.
//!
//! Anything that can [`Remote::send`] a message gets [`Invoke`] for free:
//! `invoke("multiply", args)` builds the request, waits for the correlated
//! reply, acknowledges it and unwraps the result.

use crate::error::{WireError, WireResult};
use crate::protocol::{Protocol, Reply};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tether_types::{ErrorRecord, Message, RemoteError};
use tracing::debug;

/// Something that can send a message and wait for its reply.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn send(&self, message: Message) -> WireResult<Reply>;
}

#[async_trait]
impl Remote for Arc<Protocol> {
    async fn send(&self, message: Message) -> WireResult<Reply> {
        Protocol::send(self, message).await
    }
}

/// Named remote calls on top of [`Remote`].
#[async_trait]
pub trait Invoke: Remote {
    /// Call `operation` on the peer.
    ///
    /// Returns the single reply value, `null` for an empty reply, or an
    /// array when the peer replied with several values. A reply carrying an
    /// error record fails with [`WireError::Remote`].
    async fn invoke(&self, operation: &str, arguments: Vec<Value>) -> WireResult<Value> {
        let reply = self.send(Message::request(operation, arguments)).await?;
        if let Err(e) = reply.acknowledge() {
            debug!(operation, error = %e, "Tether: acknowledgement not sent");
        }
        unwrap_result(reply.into_arguments())
    }

    /// Like [`Invoke::invoke`], deserializing the result.
    async fn call<R>(&self, operation: &str, arguments: Vec<Value>) -> WireResult<R>
    where
        R: DeserializeOwned + Send,
    {
        let value = self.invoke(operation, arguments).await?;
        serde_json::from_value(value).map_err(|e| WireError::Decode(e.to_string()))
    }
}

impl<T: Remote + ?Sized> Invoke for T {}

fn unwrap_result(mut arguments: Vec<Value>) -> WireResult<Value> {
    match arguments.len() {
        0 => Ok(Value::Null),
        1 => {
            let value = arguments.remove(0);
            match ErrorRecord::detect(&value) {
                Some(record) => Err(WireError::Remote(RemoteError::from(record))),
                None => Ok(value),
            }
        }
        _ => Ok(Value::Array(arguments)),
    }
}
