//! Core types for the Tether bidirectional RPC protocol.
//!
//! This crate defines the wire envelope (instructions and messages), the
//! remote error record, the shared error types and the configuration
//! structures. It contains no I/O.

pub mod config;
pub mod error;
pub mod message;

pub use config::{ClientConfig, CodecKind, LogConfig, ServerConfig, TetherConfig};
pub use error::{EnvelopeError, RemoteError};
pub use message::{ErrorRecord, Instruction, InstructionKind, Message};
