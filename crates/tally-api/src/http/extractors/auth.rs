//! Session authentication extractor.
//!
//! Reads `Authorization: Bearer <token>` and resolves it through the
//! session store. Tokens are SHA-256 hashed before lookup; an unknown,
//! expired or inactive-user token is rejected with 401.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tally_core::identity::SessionResolver;
use tally_types::identity::Principal;
use tracing::debug;

use crate::http::error::AppError;
use crate::state::AppState;

/// The verified caller. Extracting this authenticates the request.
pub struct Authenticated(pub Principal);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let principal = state
            .sessions
            .resolve(token)
            .await
            .map_err(|e| AppError::Internal(format!("session lookup failed: {e}")))?;

        match principal {
            Some(principal) => Ok(Authenticated(principal)),
            None => {
                debug!("rejected unknown or expired session token");
                Err(AppError::Unauthorized("Invalid or expired session token.".to_string()))
            }
        }
    }
}

/// The token from `Authorization: Bearer <token>`.
fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    let header = parts
        .headers
        .get("authorization")
        .ok_or_else(|| AppError::Unauthorized("Missing 'Authorization: Bearer <token>' header.".to_string()))?;
    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header encoding".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Authorization header must use the Bearer scheme.".to_string()))
}
