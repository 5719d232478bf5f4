//! Signed-request verification for gateway routes.
//!
//! The body is buffered so its hash can be checked, then handed back to the
//! inner handler unchanged. Failures never reach the handler.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tally_infra::security::SignatureHeaders;
use tally_infra::security::signature::{HEADER_BODY_SHA256, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use tally_types::error::UpstreamError;
use tracing::warn;

use crate::http::error::GatewayError;
use crate::state::GatewayState;

/// Largest body accepted on a signed route.
const MAX_SIGNED_BODY_BYTES: usize = 2 * 1024 * 1024;

pub async fn verify_signature(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES).await.map_err(|_| {
        GatewayError(UpstreamError::from_status(
            413,
            "invalid_request_error",
            "body_too_large",
            "request body too large",
        ))
    })?;

    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    let headers = SignatureHeaders {
        signature: header(HEADER_SIGNATURE),
        timestamp: header(HEADER_TIMESTAMP),
        nonce: header(HEADER_NONCE),
        body_sha256: header(HEADER_BODY_SHA256),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    if let Err(e) = state
        .verifier
        .verify(parts.method.as_str(), path_and_query, &headers, &bytes)
    {
        warn!(
            method = %parts.method,
            path = %path_and_query,
            replay = e.is_replay(),
            error = %e,
            "rejected signed request"
        );
        return Err(e.into());
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
