//! Wire envelopes received over the real-time connection.
//!
//! Every frame is `{"type": <string>, "payload": <object>}`. Recognized types
//! decode into a typed payload; anything else becomes [`Envelope::Unknown`]
//! and is left for the consumer to ignore.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Message, ProtocolError};

/// `agent_started` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStarted {
    pub agent_name: String,
    pub run_id: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// `tool_executing` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecuting {
    pub tool_name: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// `agent_thinking` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThinking {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub step_number: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub agent_name: String,
}

/// `partial_result` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub content: String,
}

/// `agent_completed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCompleted {
    pub agent_name: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub metrics: Value,
}

/// `final_report` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    #[serde(default)]
    pub report: Value,
    #[serde(default)]
    pub total_duration: f64,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_message: String,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Optimistic entry the error refers to, if any.
    #[serde(default)]
    pub local_id: Option<String>,
}

/// `message_update` payload: the target id plus the fields to merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// `thread_switch` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSwitch {
    pub thread_id: String,
}

/// `thread_loaded` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadLoaded {
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// `agent_status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub agent_name: String,
    pub status: String,
}

/// `agent_typing` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTyping {
    pub is_typing: bool,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// `agent_progress` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
}

/// A decoded wire envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    AgentStarted(AgentStarted),
    ToolExecuting(ToolExecuting),
    AgentThinking(AgentThinking),
    PartialResult(PartialResult),
    AgentCompleted(AgentCompleted),
    FinalReport(FinalReport),
    Error(ErrorReport),
    /// A chat message. Kept as a raw object: it may be a confirmation of an
    /// optimistic entry (carrying `localId`) or a new server message.
    Message(Map<String, Value>),
    MessageUpdate(MessageUpdate),
    ThreadSwitch(ThreadSwitch),
    ThreadLoaded(ThreadLoaded),
    AgentStatus(AgentStatus),
    AgentTyping(AgentTyping),
    AgentProgress(AgentProgress),
    /// A type this client does not recognize.
    Unknown { kind: String, payload: Value },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "empty_object")]
    payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::Payload {
        kind: kind.to_string(),
        source,
    })
}

impl Envelope {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the frame is not an envelope or the
    /// payload of a recognized type does not match its shape.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_parts(&raw.kind, raw.payload)
    }

    /// Build an envelope from an already-split type and payload.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Payload`] on a shape mismatch.
    pub fn from_parts(kind: &str, value: Value) -> Result<Self, ProtocolError> {
        Ok(match kind {
            "agent_started" => Self::AgentStarted(payload(kind, value)?),
            "tool_executing" => Self::ToolExecuting(payload(kind, value)?),
            "agent_thinking" => Self::AgentThinking(payload(kind, value)?),
            "partial_result" => Self::PartialResult(payload(kind, value)?),
            "agent_completed" => Self::AgentCompleted(payload(kind, value)?),
            "final_report" => Self::FinalReport(payload(kind, value)?),
            "error" => Self::Error(payload(kind, value)?),
            "message" => Self::Message(payload(kind, value)?),
            "message_update" => Self::MessageUpdate(payload(kind, value)?),
            "thread_switch" => Self::ThreadSwitch(payload(kind, value)?),
            "thread_loaded" => Self::ThreadLoaded(payload(kind, value)?),
            "agent_status" => Self::AgentStatus(payload(kind, value)?),
            "agent_typing" => Self::AgentTyping(payload(kind, value)?),
            "agent_progress" => Self::AgentProgress(payload(kind, value)?),
            _ => Self::Unknown {
                kind: kind.to_owned(),
                payload: value,
            },
        })
    }

    /// The wire `type` of this envelope.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::AgentStarted(_) => "agent_started",
            Self::ToolExecuting(_) => "tool_executing",
            Self::AgentThinking(_) => "agent_thinking",
            Self::PartialResult(_) => "partial_result",
            Self::AgentCompleted(_) => "agent_completed",
            Self::FinalReport(_) => "final_report",
            Self::Error(_) => "error",
            Self::Message(_) => "message",
            Self::MessageUpdate(_) => "message_update",
            Self::ThreadSwitch(_) => "thread_switch",
            Self::ThreadLoaded(_) => "thread_loaded",
            Self::AgentStatus(_) => "agent_status",
            Self::AgentTyping(_) => "agent_typing",
            Self::AgentProgress(_) => "agent_progress",
            Self::Unknown { kind, .. } => kind,
        }
    }
}
