//! Envelope codecs.
//!
//! A codec is the byte-level half of the protocol: it turns a [`Message`]
//! into a transport frame and back. Decoding always validates the envelope,
//! so a `REQUEST` without an operation or an unknown kind tag never reaches
//! the engine.

use crate::error::WireError;
use crate::transport::FrameKind;
use std::sync::Arc;
use tether_types::config::CodecKind;
use tether_types::Message;

/// A pluggable encode/decode pair for envelopes.
pub trait Codec: Send + Sync + 'static {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Whether encoded frames are text or binary.
    fn frame_kind(&self) -> FrameKind;

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError>;

    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError>;
}

/// JSON envelopes in text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn frame_kind(&self) -> FrameKind {
        FrameKind::Text
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(message).map_err(|e| WireError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError> {
        let message: Message =
            serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        message
            .validate()
            .map_err(|e| WireError::Decode(e.to_string()))?;
        Ok(message)
    }
}

/// MessagePack envelopes (map-based, named fields) in binary frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn frame_kind(&self) -> FrameKind {
        FrameKind::Binary
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(message).map_err(|e| WireError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError> {
        let message: Message =
            rmp_serde::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        message
            .validate()
            .map_err(|e| WireError::Decode(e.to_string()))?;
        Ok(message)
    }
}

/// Build the codec selected in configuration.
pub fn codec_for(kind: CodecKind) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Json => Arc::new(JsonCodec),
        CodecKind::Msgpack => Arc::new(MessagePackCodec),
    }
}
