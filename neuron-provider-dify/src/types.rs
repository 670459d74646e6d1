//! Dify chat-messages API request and stream event types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response mode sent with every request. Blocking mode is not supported.
pub(crate) const RESPONSE_MODE_STREAMING: &str = "streaming";

/// End-user identifier sent with every request.
pub(crate) const DEFAULT_USER: &str = "user";

/// `POST /v1/chat-messages` request body.
#[derive(Debug, Serialize)]
pub(crate) struct ChatMessagesRequest {
    /// App input variables. Always empty.
    pub inputs: HashMap<String, Value>,
    /// The user's query (content of the last user message).
    pub query: String,
    /// Always `"streaming"`.
    pub response_mode: &'static str,
    /// Conversation to continue; empty string starts a new one.
    pub conversation_id: String,
    /// End-user identifier.
    pub user: &'static str,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// One `data: ` payload as it appears on the wire.
///
/// Every field is optional so that any JSON object decodes; classification
/// into [`DifyEvent`] happens afterwards.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawEvent {
    /// Discriminator.
    #[serde(default)]
    pub event: Option<String>,
    /// Text fragment (`agent_message`).
    #[serde(default)]
    pub answer: Option<String>,
    /// Message identifier.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Usage and retriever metadata (`message_end`).
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
    // The remaining fields only mean something on `error` events and are
    // left untyped so other events may carry them with any shape.
    /// Error code (`error`).
    #[serde(default)]
    pub code: Option<Value>,
    /// Error message (`error`).
    #[serde(default)]
    pub message: Option<Value>,
    /// HTTP-style status (`error`).
    #[serde(default)]
    pub status: Option<Value>,
}

/// `metadata` object of a `message_end` event.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventMetadata {
    #[serde(default)]
    pub usage: Option<EventUsage>,
}

/// `metadata.usage` object. Missing counters read as zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct EventUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Stream events the translator understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DifyEvent {
    /// Incremental assistant text.
    AgentMessage {
        message_id: Option<String>,
        answer: String,
    },
    /// End of the assistant turn, optionally with usage.
    MessageEnd {
        message_id: Option<String>,
        usage: Option<EventUsage>,
    },
    /// Server-side failure reported in-band.
    Error {
        status: Option<u16>,
        code: Option<String>,
        message: Option<String>,
    },
    /// Any other discriminator, or none. Ignored.
    Other(Option<String>),
}

impl From<RawEvent> for DifyEvent {
    fn from(raw: RawEvent) -> Self {
        match raw.event.as_deref() {
            Some("agent_message") => Self::AgentMessage {
                message_id: raw.message_id,
                answer: raw.answer.unwrap_or_default(),
            },
            Some("message_end") => Self::MessageEnd {
                message_id: raw.message_id,
                usage: raw.metadata.and_then(|m| m.usage),
            },
            Some("error") => Self::Error {
                status: raw
                    .status
                    .as_ref()
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok()),
                code: raw.code.map(value_text),
                message: raw.message.map(value_text),
            },
            _ => Self::Other(raw.event),
        }
    }
}

/// Render a loosely typed field as text, without quotes for strings.
fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl DifyEvent {
    /// Decode a `data: ` payload.
    pub(crate) fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawEvent>(data).map(Self::from)
    }
}
