//! `X-Request-ID` handling.
//!
//! An incoming id is kept if it is short printable ASCII, otherwise a fresh
//! UUIDv7 is generated. The id is stored as a [`RequestId`] extension, put in
//! scope for the outbound gateway client, attached to the request span and
//! echoed on the response.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tally_infra::gateway::CURRENT_REQUEST_ID;
use tally_observe::attrs::REQUEST_ID_HEADER;
use tracing::Instrument;

use crate::http::extractors::context::RequestId;

const MAX_REQUEST_ID_LEN: usize = 128;

fn accepted(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| accepted(v))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let span = tracing::info_span!("request", request_id = %id);

    let mut response = CURRENT_REQUEST_ID
        .scope(id.clone(), next.run(request).instrument(span))
        .await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing::get;
    use tower::ServiceExt as _;

    async fn echo(RequestId(id): RequestId) -> String {
        let scoped = tally_infra::gateway::current_request_id().unwrap_or_default();
        format!("{id}|{scoped}")
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo))
            .layer(axum::middleware::from_fn(request_id))
    }

    async fn call(header: Option<&str>) -> (String, String) {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(REQUEST_ID_HEADER, value);
        }
        let response = app().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let echoed = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (echoed, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_incoming_id_is_kept_scoped_and_echoed() {
        let (echoed, body) = call(Some("req-abc")).await;
        assert_eq!(echoed, "req-abc");
        assert_eq!(body, "req-abc|req-abc");
    }

    #[tokio::test]
    async fn test_missing_or_unusable_id_is_generated() {
        let (echoed, body) = call(None).await;
        assert_eq!(echoed.len(), 36);
        assert_eq!(body, format!("{echoed}|{echoed}"));

        let (echoed, _) = call(Some(&"x".repeat(200))).await;
        assert_eq!(echoed.len(), 36);
    }

    #[test]
    fn test_accepted_ids() {
        assert!(accepted("abc-123_DEF"));
        assert!(!accepted(""));
        assert!(!accepted("has space"));
    }
}
