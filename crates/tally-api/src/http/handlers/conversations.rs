//! Conversation history endpoints for the owning user.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use tally_types::chat::{ChatMessage, Conversation};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::context::RequestId;
use crate::http::extractors::query::ListQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /v1/conversations - The caller's conversations, most recent first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    RequestId(request_id): RequestId,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse<Vec<Conversation>>, AppError> {
    let start = Instant::now();
    let conversations = state
        .chat_service
        .list_conversations(&principal, query.limit())
        .await?;
    Ok(ApiResponse::success(
        conversations,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

/// GET /v1/conversations/{id}/messages - Full history, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Result<ApiResponse<Vec<ChatMessage>>, AppError> {
    let start = Instant::now();
    let conversation_id: Uuid = id
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid conversation id '{id}'")))?;

    let messages = state
        .chat_service
        .conversation_messages(&principal, &conversation_id)
        .await?;
    Ok(ApiResponse::success(
        messages,
        request_id,
        start.elapsed().as_millis() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tally_types::config::TallyConfig;
    use tally_types::identity::UserRole;

    use crate::http::test_support::{chat_request, fake_gateway, product_app};

    fn get(path: &str, token: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(path)
            .header("authorization", format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_history_is_scoped_to_owner() {
        let gateway = fake_gateway(json!({"text": "hello", "usage": null}), None).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;

        let submit = json!({"client_message_id": "c-1", "content": "first question"});
        let (status, _, _) = app.send(chat_request(&app.seeded.token, submit)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = app.send(get("/v1/conversations", &app.seeded.token)).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        let conversations = json["data"].as_array().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0]["title"], "first question");
        let id = conversations[0]["id"].as_str().unwrap().to_string();

        let path = format!("/v1/conversations/{id}/messages");
        let (status, _, body) = app.send(get(&path, &app.seeded.token)).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        let roles: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&"user") && roles.contains(&"assistant"));

        // A colleague in the same company cannot read it.
        let other = app.add_user("colleague@example.com", UserRole::Member).await;
        let (status, _, body) = app.send(get(&path, &other)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("conversation_not_found"));
    }

    #[tokio::test]
    async fn test_invalid_conversation_id() {
        let gateway = fake_gateway(json!(null), None).await;
        let app = product_app(&gateway, TallyConfig::default(), 10, 5).await;
        let (status, _, _) = app
            .send(get("/v1/conversations/not-a-uuid/messages", &app.seeded.token))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
