//! Product API error type mapping to HTTP status codes and the envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tally_infra::gateway::current_request_id;
use tally_types::error::{ChatError, CreditError, RateLimitError, SignatureError, UpstreamError};
use tracing::error;

use crate::http::response::{ApiErrorDetail, ApiResponse};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Chat(ChatError),
    Credit(CreditError),
    RateLimited(RateLimitError),
    Unauthorized(String),
    Validation(String),
    Internal(String),
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        AppError::Chat(e)
    }
}

impl From<CreditError> for AppError {
    fn from(e: CreditError) -> Self {
        AppError::Credit(e)
    }
}

impl From<RateLimitError> for AppError {
    fn from(e: RateLimitError) -> Self {
        AppError::RateLimited(e)
    }
}

struct Mapped {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl Mapped {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn map_credit(e: &CreditError) -> Mapped {
    let message = e.to_string();
    match e {
        CreditError::CompanyCreditsInsufficient => {
            Mapped::new(StatusCode::PAYMENT_REQUIRED, "company_credits_insufficient", message)
        }
        CreditError::UserCreditsInsufficient => {
            Mapped::new(StatusCode::PAYMENT_REQUIRED, "user_credits_insufficient", message)
        }
        CreditError::InvalidUnits(_) => Mapped::new(StatusCode::BAD_REQUEST, "invalid_units", message),
        CreditError::NegativeLimit(_) => Mapped::new(StatusCode::BAD_REQUEST, "negative_limit", message),
        CreditError::ExceedsPool { .. } => Mapped::new(StatusCode::BAD_REQUEST, "exceeds_pool", message),
        CreditError::CompanyNotFound(_) => Mapped::new(StatusCode::NOT_FOUND, "company_not_found", message),
        CreditError::UserNotFound(_) => Mapped::new(StatusCode::NOT_FOUND, "user_not_found", message),
        CreditError::ProtectedUser(_) => Mapped::new(StatusCode::FORBIDDEN, "protected_user", message),
        CreditError::DuplicateKey(_) => Mapped::new(StatusCode::CONFLICT, "duplicate_idempotency_key", message),
        CreditError::Storage(_) => internal(&message),
    }
}

fn map_upstream(e: &UpstreamError) -> Mapped {
    let status = StatusCode::from_u16(e.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Mapped {
        status,
        code: e.code.clone(),
        message: e.message.clone(),
        details: Some(e.to_payload()),
    }
}

fn map_chat(e: &ChatError) -> Mapped {
    let message = e.to_string();
    match e {
        ChatError::ConversationNotFound => Mapped::new(StatusCode::NOT_FOUND, "conversation_not_found", message),
        ChatError::ContentTooLong { .. } => Mapped::new(StatusCode::BAD_REQUEST, "content_too_long", message),
        ChatError::EmptyContent => Mapped::new(StatusCode::BAD_REQUEST, "empty_content", message),
        ChatError::NoCompany => Mapped::new(StatusCode::FORBIDDEN, "no_company", message),
        ChatError::InvalidTransition { .. } => Mapped::new(StatusCode::BAD_REQUEST, "invalid_transition", message),
        ChatError::Conflict(_) => Mapped::new(StatusCode::CONFLICT, "conflict", message),
        ChatError::Credit(credit) => map_credit(credit),
        ChatError::Upstream(upstream) => map_upstream(upstream),
        ChatError::Storage(_) => internal(&message),
    }
}

fn internal(message: &str) -> Mapped {
    error!(error = %message, "internal error");
    Mapped::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
}

impl AppError {
    fn mapped(&self) -> Mapped {
        match self {
            AppError::Chat(e) => map_chat(e),
            AppError::Credit(e) => map_credit(e),
            AppError::RateLimited(e) => Mapped::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", e.to_string()),
            AppError::Unauthorized(msg) => Mapped::new(StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            AppError::Validation(msg) => Mapped::new(StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Internal(msg) => internal(msg),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.mapped().status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mapped = self.mapped();
        let body = ApiResponse::error(
            ApiErrorDetail {
                code: mapped.code,
                message: mapped.message,
                details: mapped.details,
            },
            current_request_id().unwrap_or_default(),
        );

        let mut response = body.into_response();
        *response.status_mut() = mapped.status;
        response
    }
}

/// Gateway error: `{"error": {type, code, message, retryable}}` with the
/// error's own status. This is the shape `SignedGatewayClient` decodes.
#[derive(Debug)]
pub struct GatewayError(pub UpstreamError);

impl From<UpstreamError> for GatewayError {
    fn from(e: UpstreamError) -> Self {
        GatewayError(e)
    }
}

impl From<SignatureError> for GatewayError {
    fn from(e: SignatureError) -> Self {
        let (status, kind, code) = match e {
            SignatureError::Replay => (409, "replay_error", "replay_detected"),
            SignatureError::MissingHeaders => (401, "authentication_error", "missing_signature"),
            SignatureError::InvalidTimestamp | SignatureError::TimestampSkew => {
                (401, "authentication_error", "invalid_timestamp")
            }
            SignatureError::BodyHashMismatch => (401, "authentication_error", "body_hash_mismatch"),
            SignatureError::InvalidSignature => (401, "authentication_error", "invalid_signature"),
        };
        GatewayError(UpstreamError::from_status(status, kind, code, &e.to_string()))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = serde_json::json!({ "error": self.0.to_payload() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::error::RateDimension;
    use uuid::Uuid;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (AppError::RateLimited(RateLimitError::Exceeded(RateDimension::Ip)), StatusCode::TOO_MANY_REQUESTS),
            (ChatError::ContentTooLong { max: 4000 }.into(), StatusCode::BAD_REQUEST),
            (CreditError::CompanyCreditsInsufficient.into(), StatusCode::PAYMENT_REQUIRED),
            (ChatError::Credit(CreditError::UserCreditsInsufficient).into(), StatusCode::PAYMENT_REQUIRED),
            (ChatError::NoCompany.into(), StatusCode::FORBIDDEN),
            (CreditError::ProtectedUser(Uuid::nil()).into(), StatusCode::FORBIDDEN),
            (ChatError::ConversationNotFound.into(), StatusCode::NOT_FOUND),
            (CreditError::DuplicateKey("k".to_string()).into(), StatusCode::CONFLICT),
            (AppError::Unauthorized("no".to_string()), StatusCode::UNAUTHORIZED),
            (ChatError::Upstream(UpstreamError::timeout()).into(), StatusCode::BAD_GATEWAY),
            (ChatError::Upstream(UpstreamError::missing_api_key()).into(), StatusCode::SERVICE_UNAVAILABLE),
            (ChatError::Storage("disk".to_string()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_upstream_error_carries_normalized_details() {
        let response = AppError::Chat(ChatError::Upstream(UpstreamError::timeout())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        let error = &json["errors"][0];
        assert_eq!(error["code"], "upstream_timeout");
        assert_eq!(error["details"]["type"], "upstream_error");
        assert_eq!(error["details"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_gateway_signature_errors() {
        let response = GatewayError::from(SignatureError::Replay).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "replay_detected");
        assert_eq!(json["error"]["retryable"], false);

        let response = GatewayError::from(SignatureError::TimestampSkew).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn test_storage_detail_is_not_leaked() {
        let response = AppError::Chat(ChatError::Storage("near \"SELEC\": syntax error".to_string())).into_response();
        let json = body_json(response).await;
        assert_eq!(json["errors"][0]["code"], "internal_error");
        assert_eq!(json["errors"][0]["message"], "internal server error");
    }
}
