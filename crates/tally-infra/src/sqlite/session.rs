//! Session-token lookup.
//!
//! Bearer tokens are never stored; `sessions.token_hash` holds the hex
//! SHA-256 of the token, and lookups hash the presented token the same way.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tally_core::identity::SessionResolver;
use tally_types::error::RepositoryError;
use tally_types::identity::Principal;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid};

/// Hex SHA-256 of a bearer token.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// SQLite-backed implementation of `SessionResolver`.
pub struct SqliteSessionResolver {
    pool: DatabasePool,
}

impl SqliteSessionResolver {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl SessionResolver for SqliteSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Principal>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT u.id, u.company_id, u.role, u.is_superadmin
               FROM sessions s
               JOIN users u ON u.id = s.user_id
               WHERE s.token_hash = ? AND s.expires_at > ? AND u.is_active = 1"#,
        )
        .bind(hash_token(token))
        .bind(format_datetime(&Utc::now()))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let user_id: String = row.try_get("id").map_err(|e| RepositoryError::Query(e.to_string()))?;
        let company_id: Option<String> = row
            .try_get("company_id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let role: String = row.try_get("role").map_err(|e| RepositoryError::Query(e.to_string()))?;
        let is_superadmin: bool = row
            .try_get("is_superadmin")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(Principal {
            user_id: parse_uuid(&user_id, "user id")?,
            company_id: company_id.as_deref().map(|c| parse_uuid(c, "company_id")).transpose()?,
            role: role.parse().map_err(RepositoryError::Query)?,
            is_superadmin,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::directory::SqliteDirectory;
    use chrono::Duration;
    use tally_types::identity::UserRole;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[test]
    fn test_hash_token_is_hex_sha256() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_resolve_valid_token() {
        let pool = test_pool().await;
        let directory = SqliteDirectory::new(pool.clone());
        let company = directory.create_company("Acme").await.unwrap();
        let user = directory
            .create_user(Some(company), "u@acme.test", UserRole::Owner, false)
            .await
            .unwrap();
        let token = directory.issue_session(&user, Duration::hours(1)).await.unwrap();

        let resolver = SqliteSessionResolver::new(pool);
        let principal = resolver.resolve(&token).await.unwrap().unwrap();
        assert_eq!(principal.user_id, user);
        assert_eq!(principal.company_id, Some(company));
        assert_eq!(principal.role, UserRole::Owner);

        assert!(resolver.resolve("not-a-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_and_inactive_sessions_do_not_resolve() {
        let pool = test_pool().await;
        let directory = SqliteDirectory::new(pool.clone());
        let user = directory.create_user(None, "e@acme.test", UserRole::Member, false).await.unwrap();
        directory.insert_session(&user, "expired", Duration::seconds(-5)).await.unwrap();
        directory.insert_session(&user, "live", Duration::hours(1)).await.unwrap();

        let resolver = SqliteSessionResolver::new(pool);
        assert!(resolver.resolve("expired").await.unwrap().is_none());
        assert!(resolver.resolve("live").await.unwrap().is_some());

        directory.set_user_active(&user, false).await.unwrap();
        assert!(resolver.resolve("live").await.unwrap().is_none());
    }
}
