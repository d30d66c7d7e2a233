//! Wire envelope types.
//!
//! Every exchange between two Tether endpoints is a [`Message`]: a
//! correlation id plus an [`Instruction`]. An exchange has at most three
//! stages (`REQUEST`, `REPLY`, `REPLY_TO_REPLY`) and [`Message::make_reply`]
//! is the whole state machine that advances between them.
//!
//! Logical wire shape, independent of the codec:
//!
//! ```text
//! { id, instruction: { type: 0|1|2, command, args: [...] } }
//! ```

use crate::error::{EnvelopeError, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stage of an exchange, encoded on the wire as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum InstructionKind {
    /// The initial call.
    Request = 0,
    /// The answer to a request.
    Reply = 1,
    /// Acknowledgement of a reply. Terminal.
    ReplyToReply = 2,
}

impl InstructionKind {
    /// The stage that answers this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Request => Some(Self::Reply),
            Self::Reply => Some(Self::ReplyToReply),
            Self::ReplyToReply => None,
        }
    }

    /// Whether a message of this kind can still be answered.
    pub fn expects_reply(self) -> bool {
        self.next().is_some()
    }

    /// Whether this kind settles an outstanding exchange (rather than being routed).
    pub fn is_reply(self) -> bool {
        !matches!(self, Self::Request)
    }
}

impl From<InstructionKind> for u8 {
    fn from(kind: InstructionKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for InstructionKind {
    type Error = EnvelopeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Request),
            1 => Ok(Self::Reply),
            2 => Ok(Self::ReplyToReply),
            other => Err(EnvelopeError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "REQUEST"),
            Self::Reply => write!(f, "REPLY"),
            Self::ReplyToReply => write!(f, "REPLY_TO_REPLY"),
        }
    }
}

/// The semantic payload of one protocol stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Stage of the exchange.
    #[serde(rename = "type")]
    pub kind: InstructionKind,
    /// Remote operation name. Carried unchanged on replies.
    #[serde(rename = "command", default)]
    pub operation: String,
    /// Ordered arguments. Errors are substituted by an [`ErrorRecord`].
    #[serde(rename = "args", default)]
    pub arguments: Vec<Value>,
}

impl Instruction {
    /// Create an instruction of the given kind.
    pub fn new(kind: InstructionKind, operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            arguments,
        }
    }

    /// Create a `REQUEST` instruction.
    pub fn request(operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::new(InstructionKind::Request, operation, arguments)
    }
}

/// An instruction bound to a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id, unique per outstanding exchange on a connection.
    pub id: String,
    /// The instruction carried by this stage.
    pub instruction: Instruction,
}

impl Message {
    /// Wrap an instruction with a fresh random id.
    pub fn new(instruction: Instruction) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), instruction)
    }

    /// Wrap an instruction with an explicit id.
    pub fn with_id(id: impl Into<String>, instruction: Instruction) -> Self {
        Self {
            id: id.into(),
            instruction,
        }
    }

    /// Build a `REQUEST` message with a fresh id.
    pub fn request(operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::new(Instruction::request(operation, arguments))
    }

    /// Stage of this message in its exchange.
    pub fn kind(&self) -> InstructionKind {
        self.instruction.kind
    }

    /// Operation name. Empty on replies.
    pub fn operation(&self) -> &str {
        &self.instruction.operation
    }

    /// Positional arguments.
    pub fn arguments(&self) -> &[Value] {
        &self.instruction.arguments
    }

    /// Produce the next stage of this exchange, keeping id and operation.
    ///
    /// `REQUEST` becomes `REPLY`, `REPLY` becomes `REPLY_TO_REPLY`. A
    /// `REPLY_TO_REPLY` cannot be answered.
    pub fn make_reply(&self, arguments: Vec<Value>) -> Result<Message, EnvelopeError> {
        let kind = self
            .kind()
            .next()
            .ok_or_else(|| EnvelopeError::InvalidReply {
                id: self.id.clone(),
            })?;
        Ok(Self::with_id(
            self.id.clone(),
            Instruction::new(kind, self.instruction.operation.clone(), arguments),
        ))
    }

    /// Check the invariants a decoded envelope must satisfy.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.kind() == InstructionKind::Request && self.instruction.operation.is_empty() {
            return Err(EnvelopeError::MissingOperation {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// The substitution record that carries an error across the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Always `true` for a genuine record.
    #[serde(rename = "isError", alias = "error")]
    pub is_error: bool,
    /// The error message.
    pub message: String,
    /// The error's source chain, one cause per line.
    pub stack: String,
}

impl ErrorRecord {
    /// Record a failure with its message and stack text.
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            is_error: true,
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Capture an error and its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(err.to_string(), stack)
    }

    /// Recognize an error record inside an argument value.
    ///
    /// Accepts `isError` as well as the older `error` flag.
    pub fn detect(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let flag = object
            .get("isError")
            .or_else(|| object.get("error"))?
            .as_bool()?;
        if !flag {
            return None;
        }
        let message = object.get("message")?.as_str()?;
        let stack = object.get("stack")?.as_str()?;
        Some(Self::new(message, stack))
    }
}

impl From<ErrorRecord> for Value {
    fn from(record: ErrorRecord) -> Self {
        serde_json::json!({
            "isError": record.is_error,
            "message": record.message,
            "stack": record.stack,
        })
    }
}

impl From<ErrorRecord> for RemoteError {
    fn from(record: ErrorRecord) -> Self {
        RemoteError::new(record.message, record.stack)
    }
}
