//! ChatRepository trait definition.
//!
//! Follows the same RPITIT pattern as `CreditLedger`. The one operation that
//! crosses into the ledger, [`ChatRepository::create_turn`], inserts both
//! messages and reserves credits in a single transaction.

use tally_types::chat::{ChatMessage, ChatTurn, Conversation, NewTurn};
use tally_types::error::{ChatError, RepositoryError};
use uuid::Uuid;

/// Result of trying to insert a new turn.
#[derive(Debug)]
pub enum TurnInsert {
    Created(ChatTurn),
    /// A concurrent submission with the same `(conversation, client_message_id)`
    /// won; nothing was written. Re-read it with `find_turn`.
    Raced,
}

/// Repository trait for conversation and message persistence.
///
/// Implementations live in tally-infra (e.g., `SqliteChatRepository`).
pub trait ChatRepository: Send + Sync {
    /// Get a conversation only if it belongs to this company and user.
    fn find_conversation(
        &self,
        conversation_id: &Uuid,
        company_id: &Uuid,
        user_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Conversation>, RepositoryError>> + Send;

    /// Conversations for one user, most recently active first.
    fn list_conversations(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<Conversation>, RepositoryError>> + Send;

    /// Look up a turn by the user message's client idempotency token.
    fn find_turn(
        &self,
        conversation_id: &Uuid,
        client_message_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ChatTurn>, RepositoryError>> + Send;

    /// Insert the completed user message, the pending assistant message and
    /// the credit reservation for the assistant message, all or nothing.
    /// `turn.new_conversation`, when set, is part of the same transaction.
    ///
    /// Credit rejections surface as `ChatError::Credit`.
    fn create_turn(
        &self,
        turn: &NewTurn,
    ) -> impl std::future::Future<Output = Result<TurnInsert, ChatError>> + Send;

    /// The most recent `limit` completed messages, oldest first.
    fn recent_completed(
        &self,
        conversation_id: &Uuid,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    /// Every message of a conversation, oldest first.
    fn list_messages(
        &self,
        conversation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, RepositoryError>> + Send;

    fn get_message(
        &self,
        message_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChatMessage>, RepositoryError>> + Send;

    /// `pending -> completed`. Returns `false` if the message was not pending.
    fn complete_assistant(
        &self,
        message_id: &Uuid,
        content: &str,
        model: &str,
        usage: Option<&serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `pending -> error`, keeping whatever partial content was produced.
    /// Returns `false` if the message was not pending.
    fn fail_assistant(
        &self,
        message_id: &Uuid,
        partial_content: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
