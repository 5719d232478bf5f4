//! Verified caller identity.
//!
//! Session issuance lives outside this system; by the time a request reaches
//! the chat pipeline it carries a [`Principal`] resolved from a session token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// A user's role inside their company.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (role IN ('owner', 'admin', 'member'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    Member,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Owner => write!(f, "owner"),
            UserRole::Admin => write!(f, "admin"),
            UserRole::Member => write!(f, "member"),
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(UserRole::Owner),
            "admin" => Ok(UserRole::Admin),
            "member" => Ok(UserRole::Member),
            other => Err(format!("invalid user role: '{other}'")),
        }
    }
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Member
    }
}

/// The verified `(user, company, role, privileged)` tuple for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    /// `None` once the user has been detached from their company.
    pub company_id: Option<Uuid>,
    pub role: UserRole,
    pub is_superadmin: bool,
}

impl Principal {
    /// Superadmins and company owners cannot be detached.
    pub fn is_protected(&self) -> bool {
        self.is_superadmin || self.role == UserRole::Owner
    }
}

/// A user row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub company_id: Option<Uuid>,
    pub role: UserRole,
    pub is_active: bool,
    pub is_superadmin: bool,
    pub joined_company_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.id,
            company_id: self.company_id,
            role: self.role,
            is_superadmin: self.is_superadmin,
        }
    }
}
