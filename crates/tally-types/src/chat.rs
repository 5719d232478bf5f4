//! Conversation and message types.
//!
//! A chat turn is a pair of messages: the user's message, created
//! `completed`, and its assistant reply, created `pending` and moved exactly
//! once to `completed` or `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// Message lifecycle status.
///
/// Maps to `CHECK (status IN ('pending', 'completed', 'error'))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Completed => write!(f, "completed"),
            MessageStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MessageStatus::Pending),
            "completed" => Ok(MessageStatus::Completed),
            "error" => Ok(MessageStatus::Error),
            other => Err(format!("invalid message status: '{other}'")),
        }
    }
}

/// A conversation owned by one user within one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub status: MessageStatus,
    /// Assistant messages point at the user message that produced them.
    pub parent_id: Option<Uuid>,
    /// Client-supplied idempotency token, unique within the conversation.
    pub client_message_id: Option<String>,
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One chat submission as the client sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitChat {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub client_message_id: String,
    pub content: String,
    #[serde(default)]
    pub stream: bool,
}

/// A user message and its paired assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub conversation_id: Uuid,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
}

/// Everything needed to insert a new turn and bill it.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conversation_id: Uuid,
    /// Set when this turn opens the conversation. It is inserted in the same
    /// transaction, so a rejected turn leaves no conversation behind.
    pub new_conversation: Option<Conversation>,
    pub company_id: Uuid,
    pub user_id: Uuid,
    pub client_message_id: String,
    pub content: String,
    pub model: String,
    pub credit_units: i64,
}

/// Non-streaming response body for a chat submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnReceipt {
    pub conversation_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub assistant_status: MessageStatus,
    pub client_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

impl TurnReceipt {
    /// Build a receipt from the turn's current persisted state.
    pub fn from_turn(turn: &ChatTurn) -> Self {
        let assistant = &turn.assistant_message;
        let content = (assistant.status == MessageStatus::Completed).then(|| assistant.content.clone());
        Self {
            conversation_id: turn.conversation_id,
            user_message_id: turn.user_message.id,
            assistant_message_id: assistant.id,
            assistant_status: assistant.status,
            client_message_id: turn.user_message.client_message_id.clone().unwrap_or_default(),
            content,
            usage: assistant.usage.clone(),
        }
    }
}
