//! Chat service: the message state machine for one submission.
//!
//! ```text
//! absent -> user completed -> assistant pending -> assistant completed
//!                                               \-> assistant error
//! ```
//!
//! `submit` resolves idempotency and bills the turn; `complete` and `stream`
//! call upstream and persist the terminal state. Credits reserved by
//! `submit` are never returned, whatever the upstream outcome.

use chrono::Utc;
use tally_types::chat::{
    ChatMessage, ChatTurn, Conversation, MessageStatus, NewTurn, SubmitChat, TurnReceipt,
};
use tally_types::config::ChatConfig;
use tally_types::error::{ChatError, UpstreamError};
use tally_types::identity::Principal;
use tally_types::upstream::{ChatMetadata, ContextMessage, GatewayChatRequest, RelayEvent, UpstreamReply};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::relay::{RelayOutcome, relay};
use crate::chat::repository::{ChatRepository, TurnInsert};
use crate::upstream::ChatUpstream;

/// Tunables for the state machine.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub context_limit: usize,
    pub max_message_chars: usize,
    pub credits_per_message: i64,
    pub model: String,
    pub upstream_timeout_secs: Option<u64>,
}

impl From<&ChatConfig> for ChatSettings {
    fn from(config: &ChatConfig) -> Self {
        Self {
            context_limit: config.context_limit,
            max_message_chars: config.max_message_chars,
            credits_per_message: config.credits_per_message,
            model: config.model.clone(),
            upstream_timeout_secs: Some(config.gateway_timeout_secs),
        }
    }
}

/// A billed turn plus the upstream request built for it.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub turn: ChatTurn,
    pub request: GatewayChatRequest,
}

/// What `submit` resolved to.
#[derive(Debug, Clone)]
pub enum Submission {
    /// The client message was seen before. Nothing was billed.
    Existing(ChatTurn),
    /// A new, billed turn whose assistant message is pending.
    Fresh(PreparedTurn),
}

/// Orchestrates chat submissions.
///
/// Generic over `ChatRepository` and `ChatUpstream` so tally-core never
/// depends on tally-infra.
pub struct ChatService<R: ChatRepository, U: ChatUpstream> {
    repo: R,
    upstream: U,
    settings: ChatSettings,
}

impl<R: ChatRepository, U: ChatUpstream> ChatService<R, U> {
    pub fn new(repo: R, upstream: U, settings: ChatSettings) -> Self {
        Self {
            repo,
            upstream,
            settings,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    // --- Submission ---

    /// Resolve the conversation, short-circuit resubmissions, and otherwise
    /// insert and bill a new turn.
    pub async fn submit(
        &self,
        principal: &Principal,
        submission: &SubmitChat,
    ) -> Result<Submission, ChatError> {
        let company_id = principal.company_id.ok_or(ChatError::NoCompany)?;

        let (conversation_id, new_conversation) = match submission.conversation_id {
            Some(conversation_id) => {
                self.repo
                    .find_conversation(&conversation_id, &company_id, &principal.user_id)
                    .await?
                    .ok_or(ChatError::ConversationNotFound)?;

                if let Some(turn) = self
                    .repo
                    .find_turn(&conversation_id, &submission.client_message_id)
                    .await?
                {
                    info!(
                        conversation_id = %conversation_id,
                        assistant_message_id = %turn.assistant_message.id,
                        status = %turn.assistant_message.status,
                        "resubmission of known client message"
                    );
                    return Ok(Submission::Existing(turn));
                }
                (conversation_id, None)
            }
            // Nothing to look up in a brand-new conversation. It is written
            // together with the turn.
            None => {
                let conversation = open_conversation(company_id, principal.user_id, &submission.content);
                (conversation.id, Some(conversation))
            }
        };

        self.validate_content(&submission.content)?;

        let new_turn = NewTurn {
            conversation_id,
            new_conversation,
            company_id,
            user_id: principal.user_id,
            client_message_id: submission.client_message_id.clone(),
            content: submission.content.clone(),
            model: self.settings.model.clone(),
            credit_units: self.settings.credits_per_message,
        };

        let turn = match self.repo.create_turn(&new_turn).await? {
            TurnInsert::Created(turn) => turn,
            TurnInsert::Raced => {
                let turn = self
                    .repo
                    .find_turn(&conversation_id, &submission.client_message_id)
                    .await?
                    .ok_or_else(|| ChatError::Conflict(submission.client_message_id.clone()))?;
                return Ok(Submission::Existing(turn));
            }
        };

        info!(
            company_id = %company_id,
            user_id = %principal.user_id,
            conversation_id = %conversation_id,
            assistant_message_id = %turn.assistant_message.id,
            "chat turn billed"
        );

        let messages = self.context(&conversation_id).await?;
        let request = GatewayChatRequest {
            messages,
            model: self.settings.model.clone(),
            stream: submission.stream,
            timeout: self.settings.upstream_timeout_secs,
            metadata: ChatMetadata {
                company_id,
                user_id: principal.user_id,
                conversation_id,
                message_id: turn.assistant_message.id,
            },
        };

        Ok(Submission::Fresh(PreparedTurn { turn, request }))
    }

    // --- Execution ---

    /// Single-shot upstream call for a fresh turn.
    pub async fn complete(&self, prepared: PreparedTurn) -> Result<TurnReceipt, ChatError> {
        let assistant_id = prepared.turn.assistant_message.id;

        match self.upstream.complete(&prepared.request).await {
            Ok(reply) => {
                self.settle_completed(&assistant_id, &reply).await?;

                let mut receipt = TurnReceipt::from_turn(&prepared.turn);
                receipt.assistant_status = MessageStatus::Completed;
                receipt.content = Some(reply.text);
                receipt.usage = reply.usage;
                Ok(receipt)
            }
            Err(error) => {
                warn!(
                    assistant_message_id = %assistant_id,
                    code = %error.code,
                    retryable = error.retryable,
                    "upstream completion failed"
                );
                self.settle_failed(&assistant_id, "").await?;
                Err(ChatError::Upstream(error))
            }
        }
    }

    /// Stream a fresh turn into `sink` and persist how it ended.
    pub async fn stream(
        &self,
        prepared: PreparedTurn,
        sink: mpsc::Sender<RelayEvent>,
    ) -> Result<RelayOutcome, ChatError> {
        let assistant_id = prepared.turn.assistant_message.id;
        let upstream = self.upstream.stream(prepared.request);
        let outcome = relay(upstream, &sink).await;

        match &outcome {
            RelayOutcome::Completed(reply) => {
                info!(assistant_message_id = %assistant_id, chars = reply.text.len(), "stream completed")
            }
            RelayOutcome::Failed { error, .. } => warn!(
                assistant_message_id = %assistant_id,
                code = %error.code,
                "stream failed"
            ),
            RelayOutcome::Disconnected { partial } => warn!(
                assistant_message_id = %assistant_id,
                partial_chars = partial.len(),
                "client disconnected mid-stream"
            ),
        }

        match &outcome {
            RelayOutcome::Completed(reply) => self.settle_completed(&assistant_id, reply).await?,
            RelayOutcome::Failed { partial, .. } | RelayOutcome::Disconnected { partial } => {
                self.settle_failed(&assistant_id, partial).await?
            }
        }
        Ok(outcome)
    }

    /// Frames sent to a streaming client that resubmitted a known message.
    pub fn replay_events(turn: &ChatTurn) -> Vec<RelayEvent> {
        let assistant = &turn.assistant_message;
        match assistant.status {
            MessageStatus::Completed => vec![RelayEvent::Final {
                text: assistant.content.clone(),
                usage: assistant.usage.clone(),
            }],
            MessageStatus::Pending => vec![RelayEvent::Error(UpstreamError {
                kind: "conflict".to_string(),
                code: "message_pending".to_string(),
                message: "assistant message is still pending".to_string(),
                retryable: true,
                status: 409,
            })],
            MessageStatus::Error => vec![RelayEvent::Error(UpstreamError {
                kind: "upstream_error".to_string(),
                code: "message_failed".to_string(),
                message: "assistant message previously failed".to_string(),
                retryable: false,
                status: 409,
            })],
        }
    }

    // --- Read side ---

    pub async fn list_conversations(
        &self,
        principal: &Principal,
        limit: i64,
    ) -> Result<Vec<Conversation>, ChatError> {
        let company_id = principal.company_id.ok_or(ChatError::NoCompany)?;
        Ok(self
            .repo
            .list_conversations(&company_id, &principal.user_id, limit)
            .await?)
    }

    pub async fn conversation_messages(
        &self,
        principal: &Principal,
        conversation_id: &Uuid,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let company_id = principal.company_id.ok_or(ChatError::NoCompany)?;
        self.repo
            .find_conversation(conversation_id, &company_id, &principal.user_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;
        Ok(self.repo.list_messages(conversation_id).await?)
    }

    // --- Helpers ---

    fn validate_content(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if content.chars().count() > self.settings.max_message_chars {
            return Err(ChatError::ContentTooLong {
                max: self.settings.max_message_chars,
            });
        }
        Ok(())
    }

    async fn context(&self, conversation_id: &Uuid) -> Result<Vec<ContextMessage>, ChatError> {
        let recent = self
            .repo
            .recent_completed(conversation_id, self.settings.context_limit)
            .await?;
        Ok(recent
            .into_iter()
            .map(|m| ContextMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    async fn settle_completed(&self, assistant_id: &Uuid, reply: &UpstreamReply) -> Result<(), ChatError> {
        let transitioned = self
            .repo
            .complete_assistant(assistant_id, &reply.text, &self.settings.model, reply.usage.as_ref())
            .await?;
        self.ensure_transitioned(assistant_id, transitioned).await
    }

    async fn settle_failed(&self, assistant_id: &Uuid, partial: &str) -> Result<(), ChatError> {
        let transitioned = self.repo.fail_assistant(assistant_id, partial).await?;
        self.ensure_transitioned(assistant_id, transitioned).await
    }

    /// A terminal message never moves again.
    async fn ensure_transitioned(&self, assistant_id: &Uuid, transitioned: bool) -> Result<(), ChatError> {
        if transitioned {
            return Ok(());
        }
        let status = self
            .repo
            .get_message(assistant_id)
            .await?
            .map(|m| m.status)
            .unwrap_or(MessageStatus::Error);
        Err(ChatError::InvalidTransition {
            message_id: *assistant_id,
            status,
        })
    }
}

/// A conversation titled after its first message. Not yet persisted.
fn open_conversation(company_id: Uuid, user_id: Uuid, first_message: &str) -> Conversation {
    let now = Utc::now();
    let title: String = first_message.trim().chars().take(60).collect();
    Conversation {
        id: Uuid::now_v7(),
        company_id,
        user_id,
        title: Some(title),
        created_at: now,
        last_message_at: now,
    }
}
