use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::fmt;

use crate::chat::MessageStatus;

/// Errors from repository operations (used by trait definitions in tally-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Why a signed internal request was refused.
///
/// Everything except [`SignatureError::Replay`] is an authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature headers")]
    MissingHeaders,

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("timestamp outside allowed skew")]
    TimestampSkew,

    #[error("body hash mismatch")]
    BodyHashMismatch,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("replay detected")]
    Replay,
}

impl SignatureError {
    pub fn is_replay(&self) -> bool {
        matches!(self, SignatureError::Replay)
    }
}

/// Rate-limit dimension that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateDimension {
    Company,
    User,
    Ip,
}

impl fmt::Display for RateDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateDimension::Company => write!(f, "company"),
            RateDimension::User => write!(f, "user"),
            RateDimension::Ip => write!(f, "ip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {0}")]
    Exceeded(RateDimension),
}

/// Credit ledger failures.
#[derive(Debug, Error)]
pub enum CreditError {
    #[error("credit units must be positive, got {0}")]
    InvalidUnits(i64),

    #[error("company credits insufficient")]
    CompanyCreditsInsufficient,

    #[error("user credits insufficient")]
    UserCreditsInsufficient,

    #[error("limit would become negative ({0})")]
    NegativeLimit(i64),

    #[error("allocation {allocated} would exceed pool balance {pool_balance}")]
    ExceedsPool { allocated: i64, pool_balance: i64 },

    #[error("company {0} not found")]
    CompanyNotFound(Uuid),

    #[error("user {0} not found in company")]
    UserNotFound(Uuid),

    #[error("user {0} is protected and cannot be detached")]
    ProtectedUser(Uuid),

    #[error("duplicate idempotency_key '{0}'")]
    DuplicateKey(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for CreditError {
    fn from(err: RepositoryError) -> Self {
        CreditError::Storage(err.to_string())
    }
}

/// Normalized upstream failure: `{type, code, message, retryable}`.
///
/// `status` is the HTTP status the failure maps to; it is not serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct UpstreamError {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip, default = "default_upstream_status")]
    pub status: u16,
}

fn default_upstream_status() -> u16 {
    502
}

/// 429 and every 5xx are worth retrying; nothing else is.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

impl UpstreamError {
    /// Error reported by the provider with a non-success status.
    pub fn from_status(status: u16, kind: &str, code: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            retryable: is_retryable_status(status),
            status,
        }
    }

    /// Non-success status whose body was not the expected JSON error shape.
    pub fn unparsed(status: u16) -> Self {
        Self::from_status(status, "upstream_error", "upstream_error", "upstream error")
    }

    pub fn timeout() -> Self {
        Self::retryable_bad_gateway("upstream_timeout", "upstream request timed out")
    }

    pub fn unavailable(detail: impl fmt::Display) -> Self {
        Self::retryable_bad_gateway("upstream_unavailable", &format!("upstream unavailable: {detail}"))
    }

    pub fn empty_response() -> Self {
        Self::retryable_bad_gateway("empty_response", "upstream returned no choices")
    }

    pub fn missing_content() -> Self {
        Self::retryable_bad_gateway("missing_content", "upstream returned no content")
    }

    pub fn malformed_stream(detail: impl fmt::Display) -> Self {
        Self::retryable_bad_gateway("malformed_stream", &detail.to_string())
    }

    /// Error object embedded in a provider stream frame.
    pub fn in_stream(kind: &str, code: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            retryable: true,
            status: 502,
        }
    }

    /// The gateway itself could not be reached from the product service.
    pub fn gateway_unreachable(detail: impl fmt::Display) -> Self {
        Self {
            kind: "gateway_error".to_string(),
            code: "gateway_error".to_string(),
            message: detail.to_string(),
            retryable: true,
            status: 502,
        }
    }

    /// No provider credential configured. Reported per call, never fatal.
    pub fn missing_api_key() -> Self {
        Self {
            kind: "gateway_error".to_string(),
            code: "missing_api_key".to_string(),
            message: "provider API key is not configured".to_string(),
            retryable: false,
            status: 503,
        }
    }

    pub fn unsupported_model(model: &str) -> Self {
        Self {
            kind: "invalid_request_error".to_string(),
            code: "unsupported_model".to_string(),
            message: format!("unsupported model '{model}'"),
            retryable: false,
            status: 400,
        }
    }

    fn retryable_bad_gateway(code: &str, message: &str) -> Self {
        Self {
            kind: "upstream_error".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            retryable: true,
            status: 502,
        }
    }

    /// JSON shape sent to clients.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind,
            "code": self.code,
            "message": self.message,
            "retryable": self.retryable,
        })
    }
}

/// Chat state machine failures.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("content must not be empty")]
    EmptyContent,

    #[error("user is not attached to a company")]
    NoCompany,

    #[error("message {message_id} is already {status}")]
    InvalidTransition {
        message_id: Uuid,
        status: MessageStatus,
    },

    #[error("turn for client message '{0}' is already being processed")]
    Conflict(String),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        ChatError::Storage(err.to_string())
    }
}
