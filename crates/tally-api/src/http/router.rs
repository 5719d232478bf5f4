//! Axum router configuration with middleware.
//!
//! Two routers share the same middleware stack (request id, tracing):
//! - product API: bearer-authenticated chat and history, plus `/health`.
//! - gateway: every route except `/health` requires a signed request.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::middleware::request_id::request_id;
use crate::http::middleware::signature::verify_signature;
use crate::state::{AppState, GatewayState};

/// Build the client-facing product router.
pub fn build_product_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat", post(handlers::chat::submit_chat))
        .route("/v1/conversations", get(handlers::conversations::list_conversations))
        .route(
            "/v1/conversations/{id}/messages",
            get(handlers::conversations::list_messages),
        )
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Build the internal gateway router.
pub fn build_gateway_router(state: GatewayState) -> Router {
    let signed = Router::new()
        .route("/v1/chat", post(handlers::gateway::chat))
        .route("/internal/ping", post(handlers::gateway::ping))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_signature));

    Router::new()
        .merge(signed)
        .route("/health", get(handlers::gateway::health))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// GET /health - Liveness plus a database round trip (no auth required).
async fn health_check(State(state): State<AppState>) -> (StatusCode, axum::Json<serde_json::Value>) {
    let (status, label) = match state.db_pool.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    let body = serde_json::json!({
        "status": label,
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status, axum::Json(body))
}
