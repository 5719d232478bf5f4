//! Wire types for the upstream leg (product service -> gateway -> provider)
//! and the events relayed back down to the client.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::chat::MessageRole;
use crate::error::UpstreamError;

/// One message of conversation context sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Billing/tracing identifiers carried alongside a gateway request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

/// Body of `POST /v1/chat` on the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayChatRequest {
    pub messages: Vec<ContextMessage>,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// Per-request provider timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub metadata: ChatMetadata,
}

/// A complete (non-streamed) upstream answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamReply {
    pub text: String,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
}

/// A normalized item from an upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Delta(String),
    Final(UpstreamReply),
}

/// An event forwarded to the downstream client as one SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Delta { text: String },
    Final { text: String, usage: Option<serde_json::Value> },
    Error(UpstreamError),
}

impl RelayEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Delta { .. } => "delta",
            RelayEvent::Final { .. } => "final",
            RelayEvent::Error(_) => "error",
        }
    }

    /// SSE `data:` payload.
    pub fn data(&self) -> serde_json::Value {
        match self {
            RelayEvent::Delta { text } => json!({ "text": text }),
            RelayEvent::Final { text, usage } => json!({ "text": text, "usage": usage }),
            RelayEvent::Error(err) => err.to_payload(),
        }
    }
}
