//! Chat submission endpoint.
//!
//! POST /v1/chat
//!
//! Rate limits the caller, resolves idempotency and bills the turn, then
//! calls the gateway from a spawned task so a dropped request cannot strand a
//! billed turn in `pending`. Non-streaming requests get the envelope with a
//! [`TurnReceipt`]. Streaming requests get SSE frames:
//! - `delta`: incremental text: `{ "text": "..." }`
//! - `final`: `{ "text": "...", "usage": {...} | null }`
//! - `error`: `{ "type", "code", "message", "retryable" }`
//!
//! Streaming responses also carry `X-Conversation-ID` and
//! `X-Assistant-Message-ID` headers.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use tally_core::chat::relay::RelayOutcome;
use tally_core::chat::service::{PreparedTurn, Submission};
use tally_infra::gateway::CURRENT_REQUEST_ID;
use tally_observe::attrs::{
    OUTCOME_COMPLETED, OUTCOME_DISCONNECTED, OUTCOME_FAILED, OUTCOME_REPLAYED, SPAN_CHAT_RELAY, SPAN_CHAT_SUBMIT,
};
use tally_types::chat::{ChatTurn, SubmitChat, TurnReceipt};
use tally_types::identity::Principal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, Span, error, field, info_span, warn};

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::context::{ClientIp, RequestId};
use crate::http::response::ApiResponse;
use crate::http::sse::{STREAM_BUFFER, sse_response};
use crate::state::{AppState, ConcreteChatService};

/// POST /v1/chat
pub async fn submit_chat(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    ClientIp(client_ip): ClientIp,
    RequestId(request_id): RequestId,
    body: Result<Json<SubmitChat>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    let start = Instant::now();

    let span = info_span!(
        SPAN_CHAT_SUBMIT,
        user_id = %principal.user_id,
        stream = body.stream,
        outcome = field::Empty,
    );

    handle(state, principal, client_ip, request_id, body, start)
        .instrument(span)
        .await
}

async fn handle(
    state: AppState,
    principal: Principal,
    client_ip: Option<String>,
    request_id: String,
    body: SubmitChat,
    start: Instant,
) -> Result<Response, AppError> {
    if let Err(e) = state
        .rate_limiter
        .check(principal.company_id.as_ref(), &principal.user_id, client_ip.as_deref())
    {
        warn!(error = %e, "chat submission rate limited");
        return Err(e.into());
    }

    match state.chat_service.submit(&principal, &body).await? {
        Submission::Existing(turn) => {
            Span::current().record("outcome", OUTCOME_REPLAYED);
            if body.stream {
                let events = ConcreteChatService::replay_events(&turn);
                return Ok(with_turn_headers(sse_response(stream::iter(events)), &turn));
            }
            let receipt = TurnReceipt::from_turn(&turn);
            Ok(ApiResponse::success(receipt, request_id, elapsed_ms(start)).into_response())
        }
        Submission::Fresh(prepared) if body.stream => Ok(stream_turn(&state, prepared, request_id)),
        Submission::Fresh(prepared) => {
            let receipt = complete_turn(&state, prepared, request_id.clone()).await?;
            Span::current().record("outcome", OUTCOME_COMPLETED);
            Ok(ApiResponse::success(receipt, request_id, elapsed_ms(start)).into_response())
        }
    }
}

/// Settle a fresh non-streaming turn in a task of its own.
///
/// The turn is already billed, so it must reach a terminal state even if
/// the client hangs up and axum drops this handler mid-call.
async fn complete_turn(state: &AppState, prepared: PreparedTurn, request_id: String) -> Result<TurnReceipt, AppError> {
    let service = state.chat_service.clone();
    let task = async move { service.complete(prepared).await };
    tokio::spawn(CURRENT_REQUEST_ID.scope(request_id, task.in_current_span()))
        .await
        .map_err(|e| {
            error!(error = %e, "settlement task failed");
            AppError::Internal("chat settlement failed".to_string())
        })?
        .map_err(AppError::from)
}

/// Relay a fresh turn in a background task feeding the SSE body.
///
/// The task outlives the handler; dropping the response body closes the
/// channel, which the relay treats as a client disconnect.
fn stream_turn(state: &AppState, prepared: PreparedTurn, request_id: String) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let service = state.chat_service.clone();
    let turn = prepared.turn.clone();

    let span = info_span!(
        SPAN_CHAT_RELAY,
        assistant_message_id = %turn.assistant_message.id,
        outcome = field::Empty,
    );
    let task = async move {
        match service.stream(prepared, tx).await {
            Ok(outcome) => {
                Span::current().record("outcome", outcome_label(&outcome));
            }
            Err(e) => error!(error = %e, "failed to settle streamed turn"),
        }
    };
    tokio::spawn(CURRENT_REQUEST_ID.scope(request_id, task.instrument(span)));

    with_turn_headers(sse_response(ReceiverStream::new(rx)), &turn)
}

fn outcome_label(outcome: &RelayOutcome) -> &'static str {
    match outcome {
        RelayOutcome::Completed(_) => OUTCOME_COMPLETED,
        RelayOutcome::Failed { .. } => OUTCOME_FAILED,
        RelayOutcome::Disconnected { .. } => OUTCOME_DISCONNECTED,
    }
}

fn with_turn_headers(mut response: Response, turn: &ChatTurn) -> Response {
    let headers = response.headers_mut();
    for (name, id) in [
        ("x-conversation-id", turn.conversation_id),
        ("x-assistant-message-id", turn.assistant_message.id),
    ] {
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            headers.insert(name, value);
        }
    }
    response
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tally_core::chat::repository::ChatRepository;
    use tally_core::ledger::CreditLedger;
    use tally_types::chat::{MessageRole, MessageStatus};
    use tally_types::config::TallyConfig;
    use uuid::Uuid;

    use crate::http::test_support::{
        TestApp, chat_request, fake_gateway, product_app, slow_gateway, unreachable_url,
    };

    fn submit(client_message_id: &str, content: &str, stream: bool) -> Value {
        json!({ "client_message_id": client_message_id, "content": content, "stream": stream })
    }

    async fn pool_balance(app: &TestApp) -> i64 {
        app.ledger.pool_balance(&app.seeded.company).await.unwrap()
    }

    #[tokio::test]
    async fn test_non_streaming_turn_is_billed_once() {
        let gateway = fake_gateway(json!({"text": "hello", "usage": {"total_tokens": 3}}), None).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;

        let (status, _, body) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", false))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let json: Value = serde_json::from_str(&body).unwrap();
        let data = &json["data"];
        assert_eq!(data["assistant_status"], "completed");
        assert_eq!(data["content"], "hello");
        assert_eq!(data["client_message_id"], "c-1");
        assert_eq!(pool_balance(&app).await, 9);

        // Same client message id again: same assistant message, no new charge.
        let conversation_id = data["conversation_id"].as_str().unwrap();
        let retry = json!({
            "conversation_id": conversation_id,
            "client_message_id": "c-1",
            "content": "hi",
        });
        let (status, _, body) = app.send(chat_request(&app.seeded.token, retry)).await;
        assert_eq!(status, StatusCode::OK);
        let again: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(again["data"]["assistant_message_id"], data["assistant_message_id"]);
        assert_eq!(again["data"]["content"], "hello");
        assert_eq!(pool_balance(&app).await, 9);
    }

    #[tokio::test]
    async fn test_streaming_turn_relays_and_persists() {
        let sse = "event: delta\ndata: {\"text\":\"Hel\"}\n\n\
                   event: delta\ndata: {\"text\":\"lo\"}\n\n\
                   event: final\ndata: {\"text\":\"Hello\",\"usage\":{\"total_tokens\":5}}\n\n";
        let gateway = fake_gateway(json!(null), Some(sse)).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;

        let (status, headers, body) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", true))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.matches("event: delta").count(), 2);
        assert!(body.contains("event: final\ndata: {\"text\":\"Hello\",\"usage\":{\"total_tokens\":5}}"));

        // The body ends only after the relay task has settled the message.
        let assistant_id: Uuid = headers["x-assistant-message-id"].to_str().unwrap().parse().unwrap();
        let message = app.state.chat_service.repo().get_message(&assistant_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.content, "Hello");
        assert_eq!(message.usage, Some(json!({"total_tokens": 5})));
    }

    #[tokio::test]
    async fn test_streaming_resubmission_replays_final_frame() {
        let gateway = fake_gateway(json!({"text": "done", "usage": null}), None).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;

        let (_, _, body) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", false))).await;
        let first: Value = serde_json::from_str(&body).unwrap();
        let retry = json!({
            "conversation_id": first["data"]["conversation_id"],
            "client_message_id": "c-1",
            "content": "hi",
            "stream": true,
        });

        let (status, _, body) = app.send(chat_request(&app.seeded.token, retry)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.matches("event: ").count(), 1);
        assert!(body.contains("event: final\ndata: {\"text\":\"done\""));
        assert_eq!(pool_balance(&app).await, 9);
    }

    #[tokio::test]
    async fn test_missing_session_is_unauthorized() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 5).await;
        let (status, _, body) = app.send(chat_request("not-a-token", submit("c-1", "hi", false))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("\"unauthorized\""));
    }

    #[tokio::test]
    async fn test_user_limit_exhausted_is_payment_required() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 0).await;
        for i in 0..3 {
            let (status, _, body) = app
                .send(chat_request(&app.seeded.token, submit(&format!("c-{i}"), "hi", false)))
                .await;
            assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
            assert!(body.contains("user_credits_insufficient"));
        }
        assert_eq!(pool_balance(&app).await, 10);

        // Rejected first turns open no conversations.
        let conversations = app
            .state
            .chat_service
            .repo()
            .list_conversations(&app.seeded.company, &app.seeded.user, 10)
            .await
            .unwrap();
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_still_settles_billed_turn() {
        let gateway = slow_gateway(json!({"text": "late", "usage": null}), Duration::from_millis(500)).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;

        let request = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", false)));
        assert!(tokio::time::timeout(Duration::from_millis(150), request).await.is_err());
        assert_eq!(pool_balance(&app).await, 9);

        let repo = app.state.chat_service.repo();
        let conversation = repo
            .list_conversations(&app.seeded.company, &app.seeded.user, 10)
            .await
            .unwrap()
            .remove(0);
        let mut assistant = None;
        for _ in 0..100 {
            let messages = repo.list_messages(&conversation.id).await.unwrap();
            let reply = messages.into_iter().find(|m| m.role == MessageRole::Assistant).unwrap();
            if reply.status != MessageStatus::Pending {
                assistant = Some(reply);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let assistant = assistant.expect("turn never settled");
        assert_eq!(assistant.status, MessageStatus::Completed);
        assert_eq!(assistant.content, "late");
        assert_eq!(pool_balance(&app).await, 9);
    }

    #[tokio::test]
    async fn test_oversize_content_is_rejected() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 5).await;
        let (status, _, body) = app
            .send(chat_request(&app.seeded.token, submit("c-1", &"x".repeat(4001), false)))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("content_too_long"));
    }

    #[tokio::test]
    async fn test_user_rate_limit() {
        let mut config = TallyConfig::default();
        config.rate_limits.user_per_window = 1;
        let gateway = fake_gateway(json!({"text": "ok", "usage": null}), None).await;
        let app = product_app(&gateway, config, 10, 5).await;

        let (status, _, _) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", false))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, body) = app.send(chat_request(&app.seeded.token, submit("c-2", "hi", false))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("rate limit exceeded for user"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails_turn_without_refund() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 5).await;

        let (status, _, body) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", false))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "gateway_error");
        assert_eq!(json["errors"][0]["details"]["retryable"], true);
        assert_eq!(pool_balance(&app).await, 9);

        let conversations = app
            .state
            .chat_service
            .repo()
            .list_conversations(&app.seeded.company, &app.seeded.user, 10)
            .await
            .unwrap();
        let messages = app.state.chat_service.repo().list_messages(&conversations[0].id).await.unwrap();
        assert_eq!(messages.len(), 2);
        let assistant = messages.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
        assert_eq!(assistant.status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn test_streaming_unreachable_gateway_emits_error_frame() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 5).await;
        let (status, _, body) = app.send(chat_request(&app.seeded.token, submit("c-1", "hi", true))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("event: error"));
        assert!(body.contains("\"type\":\"gateway_error\""));
        assert!(body.contains("\"retryable\":true"));
    }

    #[tokio::test]
    async fn test_malformed_json_body_is_validation_error() {
        let app = product_app(&unreachable_url().await, TallyConfig::default(), 10, 5).await;
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("authorization", format!("Bearer {}", app.seeded.token))
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let (status, _, body) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("validation_error"));
    }
}
