//! Fixtures for the HTTP handler tests: a seeded product app on a temp
//! database, a gateway app, and canned upstream servers on loopback.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use secrecy::SecretString;
use serde_json::Value;
use tally_core::ledger::CreditLedger;
use tally_core::ledger::locks::RowLocks;
use tally_infra::gateway::SignedGatewayClient;
use tally_infra::provider::OpenAiProvider;
use tally_infra::sqlite::directory::SqliteDirectory;
use tally_infra::sqlite::ledger::SqliteCreditLedger;
use tally_infra::sqlite::pool::DatabasePool;
use tally_types::config::TallyConfig;
use tally_types::identity::UserRole;
use tally_types::ledger::CreditGrant;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use crate::http::router::{build_gateway_router, build_product_router};
use crate::state::{AppState, GatewayState};

pub(crate) const SHARED_SECRET: &str = "test-secret";

pub(crate) struct Seeded {
    pub company: Uuid,
    pub user: Uuid,
    pub token: String,
}

pub(crate) struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub seeded: Seeded,
    pub directory: SqliteDirectory,
    pub ledger: SqliteCreditLedger,
    _tmp: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        send_to(self.router.clone(), request).await
    }

    /// Another member of the seeded company; returns their bearer token.
    pub async fn add_user(&self, email: &str, role: UserRole) -> String {
        let user = self
            .directory
            .create_user(Some(self.seeded.company), email, role, false)
            .await
            .unwrap();
        self.directory.issue_session(&user, chrono::Duration::hours(1)).await.unwrap()
    }
}

pub(crate) async fn send_to(router: Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Product app pointed at `gateway_url`, with one member holding `limit` of
/// a `credits` pool.
pub(crate) async fn product_app(gateway_url: &str, config: TallyConfig, credits: i64, limit: i64) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tmp.path().join("test.db").display());
    let pool = DatabasePool::new(&url).await.unwrap();

    let directory = SqliteDirectory::new(pool.clone());
    let company = directory.create_company("Acme").await.unwrap();
    let user = directory
        .create_user(Some(company), "member@acme.test", UserRole::Member, false)
        .await
        .unwrap();
    let token = directory.issue_session(&user, chrono::Duration::hours(1)).await.unwrap();

    let client = SignedGatewayClient::new(
        gateway_url,
        SecretString::from(SHARED_SECRET),
        Duration::from_secs(5),
    )
    .unwrap();
    let ledger = SqliteCreditLedger::new(pool.clone(), Arc::new(RowLocks::new()));
    let state = AppState::new(pool, &config, client);

    if credits > 0 {
        ledger
            .grant_credits(&CreditGrant {
                company_id: company,
                user_id: None,
                amount: credits,
                reason: "grant".to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();
    }
    if limit > 0 {
        ledger.apply_user_limit_delta(&company, &user, limit).await.unwrap();
    }

    TestApp {
        router: build_product_router(state.clone()),
        state,
        seeded: Seeded { company, user, token },
        directory,
        ledger,
        _tmp: tmp,
    }
}

/// Gateway app forwarding to a provider at `provider_url`.
pub(crate) fn gateway_app(provider_url: &str, api_key: Option<&str>) -> Router {
    let config = TallyConfig::default();
    let provider = OpenAiProvider::new(
        provider_url,
        api_key.map(SecretString::from),
        Duration::from_secs(5),
    )
    .unwrap();
    build_gateway_router(GatewayState::new(provider, SecretString::from(SHARED_SECRET), &config))
}

/// Serve `router` on an ephemeral loopback port.
pub(crate) async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn canned(status: StatusCode, body: String) -> axum::response::Response {
    let content_type = if body.starts_with("data:") {
        "text/event-stream"
    } else {
        "application/json"
    };
    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// A gateway stand-in answering `POST /v1/chat` with `json`, or with the raw
/// `sse` text when given.
pub(crate) async fn fake_gateway(json: Value, sse: Option<&str>) -> String {
    let body = sse.map(str::to_string).unwrap_or_else(|| json.to_string());
    let router = Router::new().route(
        "/v1/chat",
        post(move || {
            let body = body.clone();
            async move { canned(StatusCode::OK, body) }
        }),
    );
    serve(router).await
}

/// Like [`fake_gateway`], but each answer is held back for `delay`.
pub(crate) async fn slow_gateway(json: Value, delay: Duration) -> String {
    let body = json.to_string();
    let router = Router::new().route(
        "/v1/chat",
        post(move || {
            let body = body.clone();
            async move {
                tokio::time::sleep(delay).await;
                canned(StatusCode::OK, body)
            }
        }),
    );
    serve(router).await
}

/// A provider stand-in answering `POST /chat/completions` with `body`.
pub(crate) async fn fake_provider(body: &str, status: Option<StatusCode>) -> String {
    let body = body.to_string();
    let status = status.unwrap_or(StatusCode::OK);
    let router = Router::new().route(
        "/chat/completions",
        post(move || {
            let body = body.clone();
            async move { canned(status, body) }
        }),
    );
    serve(router).await
}

/// A loopback URL with nothing listening.
pub(crate) async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// `POST /v1/chat` on the product API as the bearer of `token`.
pub(crate) fn chat_request(token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
