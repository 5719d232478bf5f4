//! SQLite chat repository.
//!
//! `create_turn` is the only write that touches the ledger: it takes row
//! locks in the same order as `SqliteCreditLedger` and bills the assistant
//! message inside the transaction that inserts both messages.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tally_core::chat::repository::{ChatRepository, TurnInsert};
use tally_core::ledger::locks::RowLocks;
use tally_types::chat::{ChatMessage, ChatTurn, Conversation, MessageRole, MessageStatus, NewTurn};
use tally_types::error::{ChatError, RepositoryError};
use tracing::debug;
use uuid::Uuid;

use super::ledger::reserve_in_tx;
use super::pool::DatabasePool;
use super::{format_datetime, is_unique_violation, parse_datetime, parse_uuid};

pub struct SqliteChatRepository {
    pool: DatabasePool,
    locks: Arc<RowLocks>,
}

impl SqliteChatRepository {
    pub fn new(pool: DatabasePool, locks: Arc<RowLocks>) -> Self {
        Self { pool, locks }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct ConversationRow {
    id: String,
    company_id: String,
    user_id: String,
    title: Option<String>,
    created_at: String,
    last_message_at: String,
}

impl ConversationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            user_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
            last_message_at: row.try_get("last_message_at")?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, RepositoryError> {
        Ok(Conversation {
            id: parse_uuid(&self.id, "conversation id")?,
            company_id: parse_uuid(&self.company_id, "company_id")?,
            user_id: parse_uuid(&self.user_id, "user_id")?,
            title: self.title,
            created_at: parse_datetime(&self.created_at)?,
            last_message_at: parse_datetime(&self.last_message_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    status: String,
    parent_id: Option<String>,
    client_message_id: Option<String>,
    content: String,
    model: Option<String>,
    usage_json: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: row.try_get("role")?,
            status: row.try_get("status")?,
            parent_id: row.try_get("parent_id")?,
            client_message_id: row.try_get("client_message_id")?,
            content: row.try_get("content")?,
            model: row.try_get("model")?,
            usage_json: row.try_get("usage_json")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<ChatMessage, RepositoryError> {
        let usage = self
            .usage_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid usage_json: {e}")))?;

        Ok(ChatMessage {
            id: parse_uuid(&self.id, "message id")?,
            conversation_id: parse_uuid(&self.conversation_id, "conversation_id")?,
            role: self.role.parse().map_err(RepositoryError::Query)?,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|s| parse_uuid(s, "parent_id"))
                .transpose()?,
            client_message_id: self.client_message_id,
            content: self.content,
            model: self.model,
            usage,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn map_messages(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ChatMessage>, RepositoryError> {
    rows.iter()
        .map(|row| MessageRow::from_row(row).map_err(query_err)?.into_message())
        .collect()
}

async fn insert_message(conn: &mut SqliteConnection, message: &ChatMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO messages
               (id, conversation_id, role, status, parent_id, client_message_id, content, model, usage_json, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)"#,
    )
    .bind(message.id.to_string())
    .bind(message.conversation_id.to_string())
    .bind(message.role.to_string())
    .bind(message.status.to_string())
    .bind(message.parent_id.map(|p| p.to_string()))
    .bind(&message.client_message_id)
    .bind(&message.content)
    .bind(&message.model)
    .bind(format_datetime(&message.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_conversation(conn: &mut SqliteConnection, conversation: &Conversation) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO conversations (id, company_id, user_id, title, created_at, last_message_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(conversation.id.to_string())
    .bind(conversation.company_id.to_string())
    .bind(conversation.user_id.to_string())
    .bind(&conversation.title)
    .bind(format_datetime(&conversation.created_at))
    .bind(format_datetime(&conversation.last_message_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl ChatRepository for SqliteChatRepository {
    async fn find_conversation(
        &self,
        conversation_id: &Uuid,
        company_id: &Uuid,
        user_id: &Uuid,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ? AND company_id = ? AND user_id = ?")
            .bind(conversation_id.to_string())
            .bind(company_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(ConversationRow::from_row(&row).map_err(query_err)?.into_conversation()?)),
            None => Ok(None),
        }
    }

    async fn list_conversations(
        &self,
        company_id: &Uuid,
        user_id: &Uuid,
        limit: i64,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM conversations
               WHERE company_id = ? AND user_id = ?
               ORDER BY last_message_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(company_id.to_string())
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| ConversationRow::from_row(row).map_err(query_err)?.into_conversation())
            .collect()
    }

    async fn find_turn(
        &self,
        conversation_id: &Uuid,
        client_message_id: &str,
    ) -> Result<Option<ChatTurn>, RepositoryError> {
        let user_row = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? AND client_message_id = ? AND role = 'user'",
        )
        .bind(conversation_id.to_string())
        .bind(client_message_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let Some(user_row) = user_row else {
            return Ok(None);
        };
        let user_message = MessageRow::from_row(&user_row).map_err(query_err)?.into_message()?;

        let assistant_row = sqlx::query("SELECT * FROM messages WHERE parent_id = ? AND role = 'assistant'")
            .bind(user_message.id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
            .ok_or_else(|| RepositoryError::Query(format!("user message {} has no assistant reply", user_message.id)))?;
        let assistant_message = MessageRow::from_row(&assistant_row).map_err(query_err)?.into_message()?;

        Ok(Some(ChatTurn {
            conversation_id: *conversation_id,
            user_message,
            assistant_message,
        }))
    }

    async fn create_turn(&self, turn: &NewTurn) -> Result<TurnInsert, ChatError> {
        let _locks = self.locks.acquire_user(turn.company_id, turn.user_id).await;
        let mut tx = self.pool.writer.begin().await.map_err(|e| ChatError::Storage(e.to_string()))?;

        if let Some(conversation) = &turn.new_conversation {
            insert_conversation(&mut tx, conversation)
                .await
                .map_err(|e| ChatError::Storage(e.to_string()))?;
        }

        let now = Utc::now();
        let user_message = ChatMessage {
            id: Uuid::now_v7(),
            conversation_id: turn.conversation_id,
            role: MessageRole::User,
            status: MessageStatus::Completed,
            parent_id: None,
            client_message_id: Some(turn.client_message_id.clone()),
            content: turn.content.clone(),
            model: None,
            usage: None,
            created_at: now,
        };
        if let Err(e) = insert_message(&mut tx, &user_message).await {
            if is_unique_violation(&e) {
                debug!(
                    conversation_id = %turn.conversation_id,
                    client_message_id = %turn.client_message_id,
                    "turn already inserted by a concurrent submission"
                );
                return Ok(TurnInsert::Raced);
            }
            return Err(ChatError::Storage(e.to_string()));
        }

        let assistant_message = ChatMessage {
            id: Uuid::now_v7(),
            conversation_id: turn.conversation_id,
            role: MessageRole::Assistant,
            status: MessageStatus::Pending,
            parent_id: Some(user_message.id),
            client_message_id: None,
            content: String::new(),
            model: Some(turn.model.clone()),
            usage: None,
            created_at: now,
        };
        insert_message(&mut tx, &assistant_message)
            .await
            .map_err(|e| ChatError::Storage(e.to_string()))?;

        // A rejection drops `tx`, rolling back the messages and any new
        // conversation.
        reserve_in_tx(
            &mut tx,
            &turn.company_id,
            &turn.user_id,
            &assistant_message.id,
            turn.credit_units,
        )
        .await
        .map_err(ChatError::Credit)?;

        sqlx::query("UPDATE conversations SET last_message_at = ? WHERE id = ?")
            .bind(format_datetime(&now))
            .bind(turn.conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| ChatError::Storage(e.to_string()))?;

        tx.commit().await.map_err(|e| ChatError::Storage(e.to_string()))?;

        Ok(TurnInsert::Created(ChatTurn {
            conversation_id: turn.conversation_id,
            user_message,
            assistant_message,
        }))
    }

    async fn recent_completed(&self, conversation_id: &Uuid, limit: usize) -> Result<Vec<ChatMessage>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"SELECT * FROM messages
               WHERE conversation_id = ? AND status = 'completed'
               ORDER BY created_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(conversation_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut messages = map_messages(&rows)?;
        messages.reverse();
        Ok(messages)
    }

    async fn list_messages(&self, conversation_id: &Uuid) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC")
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        map_messages(&rows)
    }

    async fn get_message(&self, message_id: &Uuid) -> Result<Option<ChatMessage>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        match row {
            Some(row) => Ok(Some(MessageRow::from_row(&row).map_err(query_err)?.into_message()?)),
            None => Ok(None),
        }
    }

    async fn complete_assistant(
        &self,
        message_id: &Uuid,
        content: &str,
        model: &str,
        usage: Option<&serde_json::Value>,
    ) -> Result<bool, RepositoryError> {
        let usage_json = usage.map(|u| u.to_string());
        let result = sqlx::query(
            r#"UPDATE messages SET status = 'completed', content = ?, model = ?, usage_json = ?
               WHERE id = ? AND role = 'assistant' AND status = 'pending'"#,
        )
        .bind(content)
        .bind(model)
        .bind(usage_json)
        .bind(message_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_assistant(&self, message_id: &Uuid, partial_content: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE messages SET status = 'error', content = ?
               WHERE id = ? AND role = 'assistant' AND status = 'pending'"#,
        )
        .bind(partial_content)
        .bind(message_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::ledger::SqliteCreditLedger;
    use crate::sqlite::ledger::tests::{fixture, force_limit, grant, ledger_rows, remaining};
    use tally_core::ledger::CreditLedger;
    use tally_types::error::CreditError;

    struct Harness {
        repo: Arc<SqliteChatRepository>,
        ledger: Arc<SqliteCreditLedger>,
        pool: DatabasePool,
        company: Uuid,
        user: Uuid,
        conversation: Uuid,
    }

    async fn harness(pool_credits: i64, limit: i64) -> Harness {
        let f = fixture().await;
        if pool_credits > 0 {
            f.ledger.grant_credits(&grant(f.company, pool_credits)).await.unwrap();
        }
        if limit > 0 {
            force_limit(&f.pool, f.company, f.user, limit).await;
        }
        let repo = Arc::new(SqliteChatRepository::new(f.pool.clone(), Arc::new(RowLocks::new())));

        let conversation = conversation(f.company, f.user, "hello");
        let mut conn = f.pool.writer.acquire().await.unwrap();
        insert_conversation(&mut conn, &conversation).await.unwrap();
        drop(conn);

        Harness {
            repo,
            ledger: f.ledger,
            pool: f.pool,
            company: f.company,
            user: f.user,
            conversation: conversation.id,
        }
    }

    fn conversation(company_id: Uuid, user_id: Uuid, title: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::now_v7(),
            company_id,
            user_id,
            title: Some(title.to_string()),
            created_at: now,
            last_message_at: now,
        }
    }

    fn new_turn(h: &Harness, client_id: &str, content: &str) -> NewTurn {
        NewTurn {
            conversation_id: h.conversation,
            new_conversation: None,
            company_id: h.company,
            user_id: h.user,
            client_message_id: client_id.to_string(),
            content: content.to_string(),
            model: "gpt-5.2".to_string(),
            credit_units: 1,
        }
    }

    fn created(insert: TurnInsert) -> ChatTurn {
        match insert {
            TurnInsert::Created(turn) => turn,
            TurnInsert::Raced => panic!("expected a created turn"),
        }
    }

    #[tokio::test]
    async fn test_create_turn_writes_messages_and_reservation() {
        let h = harness(10, 5).await;
        let turn = created(h.repo.create_turn(&new_turn(&h, "c-1", "hi")).await.unwrap());

        assert_eq!(turn.user_message.status, MessageStatus::Completed);
        assert_eq!(turn.assistant_message.status, MessageStatus::Pending);
        assert_eq!(turn.assistant_message.parent_id, Some(turn.user_message.id));

        let entries = h.ledger.list_entries(&h.company, 10).await.unwrap();
        assert_eq!(entries[0].message_id, Some(turn.assistant_message.id));
        assert_eq!(remaining(&h.pool, h.user).await, Some(4));

        let found = h.repo.find_turn(&h.conversation, "c-1").await.unwrap().unwrap();
        assert_eq!(found, turn);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_races_without_second_charge() {
        let h = harness(10, 5).await;
        let first = created(h.repo.create_turn(&new_turn(&h, "c-1", "hi")).await.unwrap());
        let second = h.repo.create_turn(&new_turn(&h, "c-1", "hi again")).await.unwrap();
        assert!(matches!(second, TurnInsert::Raced));

        let found = h.repo.find_turn(&h.conversation, "c-1").await.unwrap().unwrap();
        assert_eq!(found.assistant_message.id, first.assistant_message.id);
        assert_eq!(ledger_rows(&h.pool, h.company).await, 2);
        assert_eq!(remaining(&h.pool, h.user).await, Some(4));
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_submissions_insert_once() {
        let h = harness(10, 5).await;
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let repo = Arc::clone(&h.repo);
            let turn = new_turn(&h, "same", "hello");
            tasks.push(tokio::spawn(async move { repo.create_turn(&turn).await }));
        }

        let mut created_count = 0;
        for task in tasks {
            if let TurnInsert::Created(_) = task.await.unwrap().unwrap() {
                created_count += 1;
            }
        }
        assert_eq!(created_count, 1);
        assert_eq!(h.repo.list_messages(&h.conversation).await.unwrap().len(), 2);
        assert_eq!(remaining(&h.pool, h.user).await, Some(4));
    }

    #[tokio::test]
    async fn test_credit_rejection_rolls_back_messages() {
        let h = harness(1, 3).await;
        created(h.repo.create_turn(&new_turn(&h, "c-1", "one")).await.unwrap());

        let err = h.repo.create_turn(&new_turn(&h, "c-2", "two")).await.unwrap_err();
        assert!(matches!(err, ChatError::Credit(CreditError::CompanyCreditsInsufficient)));

        assert!(h.repo.find_turn(&h.conversation, "c-2").await.unwrap().is_none());
        assert_eq!(h.repo.list_messages(&h.conversation).await.unwrap().len(), 2);
        assert_eq!(remaining(&h.pool, h.user).await, Some(2));
    }

    #[tokio::test]
    async fn test_opening_turn_writes_conversation_only_when_billed() {
        let h = harness(1, 1).await;

        let opened = conversation(h.company, h.user, "first");
        let mut turn = new_turn(&h, "c-1", "first");
        turn.conversation_id = opened.id;
        turn.new_conversation = Some(opened.clone());
        created(h.repo.create_turn(&turn).await.unwrap());
        assert!(h.repo.find_conversation(&opened.id, &h.company, &h.user).await.unwrap().is_some());

        // Out of credit: neither the conversation nor its messages survive.
        let rejected = conversation(h.company, h.user, "second");
        let mut turn = new_turn(&h, "c-2", "second");
        turn.conversation_id = rejected.id;
        turn.new_conversation = Some(rejected.clone());
        let err = h.repo.create_turn(&turn).await.unwrap_err();
        assert!(matches!(err, ChatError::Credit(_)));
        assert!(h.repo.find_conversation(&rejected.id, &h.company, &h.user).await.unwrap().is_none());
        assert!(h.repo.list_messages(&rejected.id).await.unwrap().is_empty());
        assert_eq!(h.repo.list_conversations(&h.company, &h.user, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_turns_share_one_credit() {
        let h = harness(1, 3).await;
        let a = {
            let repo = Arc::clone(&h.repo);
            let turn = new_turn(&h, "a", "first");
            tokio::spawn(async move { repo.create_turn(&turn).await })
        };
        let b = {
            let repo = Arc::clone(&h.repo);
            let turn = new_turn(&h, "b", "second");
            tokio::spawn(async move { repo.create_turn(&turn).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(TurnInsert::Created(_)))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ChatError::Credit(CreditError::CompanyCreditsInsufficient))))
                .count(),
            1
        );
        assert_eq!(h.ledger.pool_balance(&h.company).await.unwrap(), 0);
        assert_eq!(remaining(&h.pool, h.user).await, Some(2));
    }

    #[tokio::test]
    async fn test_assistant_transitions_exactly_once() {
        let h = harness(10, 5).await;
        let turn = created(h.repo.create_turn(&new_turn(&h, "c-1", "hi")).await.unwrap());
        let id = turn.assistant_message.id;
        let usage = serde_json::json!({"total_tokens": 7});

        assert!(h.repo.complete_assistant(&id, "hello", "gpt-5.2", Some(&usage)).await.unwrap());
        assert!(!h.repo.complete_assistant(&id, "again", "gpt-5.2", None).await.unwrap());
        assert!(!h.repo.fail_assistant(&id, "partial").await.unwrap());

        let stored = h.repo.get_message(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Completed);
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.usage, Some(usage));

        // User messages are never transitioned.
        assert!(!h.repo.fail_assistant(&turn.user_message.id, "").await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_completed_is_trimmed_and_oldest_first() {
        let h = harness(20, 10).await;
        for i in 0..3 {
            let turn = created(
                h.repo
                    .create_turn(&new_turn(&h, &format!("c-{i}"), &format!("q{i}")))
                    .await
                    .unwrap(),
            );
            h.repo
                .complete_assistant(&turn.assistant_message.id, &format!("a{i}"), "gpt-5.2", None)
                .await
                .unwrap();
        }
        // A pending turn never appears in context.
        created(h.repo.create_turn(&new_turn(&h, "c-3", "q3")).await.unwrap());

        let context = h.repo.recent_completed(&h.conversation, 4).await.unwrap();
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        // "q3" is a completed user message; its pending reply is excluded.
        assert_eq!(contents, ["a1", "q2", "a2", "q3"]);
    }

    #[tokio::test]
    async fn test_conversation_ownership_and_listing() {
        let h = harness(10, 5).await;
        let other_user = Uuid::now_v7();
        assert!(
            h.repo
                .find_conversation(&h.conversation, &h.company, &other_user)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            h.repo
                .find_conversation(&h.conversation, &h.company, &h.user)
                .await
                .unwrap()
                .is_some()
        );

        let listed = h.repo.list_conversations(&h.company, &h.user, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("hello"));
    }
}
