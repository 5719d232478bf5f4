//! Company/user/session seeding for tests.
//!
//! Onboarding and invitations live outside Tally. Compiled only for tests
//! and under the `test-support` feature.

use chrono::{Duration, Utc};
use sqlx::Row;
use tally_types::error::RepositoryError;
use tally_types::identity::{UserRecord, UserRole};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::session::hash_token;
use super::{format_datetime, is_unique_violation, parse_datetime, parse_uuid};

pub struct SqliteDirectory {
    pool: DatabasePool,
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct UserRow {
    id: String,
    email: String,
    company_id: Option<String>,
    role: String,
    is_active: bool,
    is_superadmin: bool,
    joined_company_at: Option<String>,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            company_id: row.try_get("company_id")?,
            role: row.try_get("role")?,
            is_active: row.try_get("is_active")?,
            is_superadmin: row.try_get("is_superadmin")?,
            joined_company_at: row.try_get("joined_company_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<UserRecord, RepositoryError> {
        Ok(UserRecord {
            id: parse_uuid(&self.id, "user id")?,
            email: self.email,
            company_id: self
                .company_id
                .as_deref()
                .map(|s| parse_uuid(s, "company_id"))
                .transpose()?,
            role: self.role.parse().map_err(RepositoryError::Query)?,
            is_active: self.is_active,
            is_superadmin: self.is_superadmin,
            joined_company_at: self
                .joined_company_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl SqliteDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub async fn create_company(&self, name: &str) -> Result<Uuid, RepositoryError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO companies (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(id)
    }

    /// Insert an active user, optionally attached to a company.
    pub async fn create_user(
        &self,
        company_id: Option<Uuid>,
        email: &str,
        role: UserRole,
        is_superadmin: bool,
    ) -> Result<Uuid, RepositoryError> {
        let id = Uuid::now_v7();
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO users (id, email, company_id, role, is_active, is_superadmin, joined_company_at, created_at)
               VALUES (?, ?, ?, ?, 1, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(email)
        .bind(company_id.map(|c| c.to_string()))
        .bind(role.to_string())
        .bind(is_superadmin)
        .bind(company_id.map(|_| now.clone()))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("email '{email}' already registered"))
            } else {
                RepositoryError::Query(e.to_string())
            }
        })?;
        Ok(id)
    }

    pub async fn set_user_active(&self, user_id: &Uuid, active: bool) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(user_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    pub async fn get_user(&self, user_id: &Uuid) -> Result<Option<UserRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let user_row = UserRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(user_row.into_record()?))
            }
            None => Ok(None),
        }
    }

    /// Store a session for `token` (only its SHA-256 is kept).
    pub async fn insert_session(
        &self,
        user_id: &Uuid,
        token: &str,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(user_id.to_string())
        .bind(hash_token(token))
        .bind(format_datetime(&(now + ttl)))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    /// Generate a random bearer token and store its session.
    pub async fn issue_session(&self, user_id: &Uuid, ttl: Duration) -> Result<String, RepositoryError> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.insert_session(user_id, &token, ttl).await?;
        Ok(token)
    }

    pub async fn count_sessions(&self, user_id: &Uuid) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        row.try_get("n").map_err(|e| RepositoryError::Query(e.to_string()))
    }
}
