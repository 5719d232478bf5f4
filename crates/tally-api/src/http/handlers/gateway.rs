//! Internal chat gateway endpoints.
//!
//! - `GET /health`: unauthenticated liveness.
//! - `POST /internal/ping`: signed connectivity check.
//! - `POST /v1/chat`: signed; forwards one completion to the provider.
//!
//! Signature verification happens in middleware before these handlers run.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tally_core::chat::relay::{RelayOutcome, relay};
use tally_core::upstream::ChatUpstream;
use tally_observe::attrs::{OUTCOME_COMPLETED, OUTCOME_DISCONNECTED, OUTCOME_FAILED, SPAN_GATEWAY_CHAT};
use tally_types::error::UpstreamError;
use tally_types::upstream::GatewayChatRequest;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, info, info_span, warn};

use crate::http::error::GatewayError;
use crate::http::sse::{STREAM_BUFFER, sse_response};
use crate::state::GatewayState;

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.provider.name(),
        "provider_configured": state.provider.has_api_key(),
    }))
}

/// POST /internal/ping
pub async fn ping() -> Json<Value> {
    Json(json!({ "pong": true, "timestamp": chrono::Utc::now().timestamp() }))
}

/// POST /v1/chat
pub async fn chat(
    State(state): State<GatewayState>,
    body: Result<Json<GatewayChatRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(request) = body.map_err(|e| {
        GatewayError(UpstreamError::from_status(
            400,
            "invalid_request_error",
            "invalid_request",
            &e.body_text(),
        ))
    })?;

    let span = info_span!(
        SPAN_GATEWAY_CHAT,
        company_id = %request.metadata.company_id,
        message_id = %request.metadata.message_id,
        model = %request.model,
        stream = request.stream,
    );

    if request.model != state.model {
        warn!(parent: &span, requested = %request.model, "rejected unsupported model");
        return Err(UpstreamError::unsupported_model(&request.model).into());
    }

    if !request.stream {
        let reply = state
            .provider
            .complete(&request)
            .instrument(span.clone())
            .await
            .map_err(|e| {
                warn!(parent: &span, code = %e.code, status = e.status, "provider completion failed");
                GatewayError(e)
            })?;
        return Ok(Json(reply).into_response());
    }

    let upstream = state.provider.stream(request);
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let task = async move {
        let outcome = relay(upstream, &tx).await;
        match &outcome {
            RelayOutcome::Completed(reply) => {
                info!(outcome = OUTCOME_COMPLETED, chars = reply.text.len(), "stream relayed")
            }
            RelayOutcome::Failed { error, .. } => {
                warn!(outcome = OUTCOME_FAILED, code = %error.code, "provider stream failed")
            }
            RelayOutcome::Disconnected { partial } => {
                warn!(outcome = OUTCOME_DISCONNECTED, partial_chars = partial.len(), "caller disconnected")
            }
        }
    };
    tokio::spawn(task.instrument(span));

    Ok(sse_response(ReceiverStream::new(rx)))
}
