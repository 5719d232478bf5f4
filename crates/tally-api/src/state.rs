//! Application state wiring services together.
//!
//! `AppState` backs the product API and the admin CLI; `GatewayState` backs
//! the gateway. Services are generic over repository/upstream traits, but
//! the states pin them to the concrete infra implementations.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tally_core::chat::service::{ChatService, ChatSettings};
use tally_core::ledger::locks::RowLocks;
use tally_core::security::rate_limit::CompositeRateLimiter;
use tally_core::security::replay::InMemoryNonceStore;
use tally_infra::gateway::SignedGatewayClient;
use tally_infra::provider::OpenAiProvider;
use tally_infra::security::RequestVerifier;
use tally_infra::sqlite::chat::SqliteChatRepository;
use tally_infra::sqlite::pool::DatabasePool;
use tally_infra::sqlite::session::SqliteSessionResolver;
use tally_types::config::TallyConfig;

pub type ConcreteChatService = ChatService<SqliteChatRepository, SignedGatewayClient>;

/// Shared state for the product API and CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ConcreteChatService>,
    pub sessions: Arc<SqliteSessionResolver>,
    pub rate_limiter: Arc<CompositeRateLimiter>,
    pub db_pool: DatabasePool,
}

impl AppState {
    pub fn new(db_pool: DatabasePool, config: &TallyConfig, upstream: SignedGatewayClient) -> Self {
        let chat_repo = SqliteChatRepository::new(db_pool.clone(), Arc::new(RowLocks::new()));
        let chat_service = ChatService::new(chat_repo, upstream, ChatSettings::from(&config.chat));

        Self {
            chat_service: Arc::new(chat_service),
            sessions: Arc::new(SqliteSessionResolver::new(db_pool.clone())),
            rate_limiter: Arc::new(CompositeRateLimiter::from_config(&config.rate_limits)),
            db_pool,
        }
    }

    /// Build the signed gateway client from config and the shared secret.
    pub fn init(db_pool: DatabasePool, config: &TallyConfig, shared_secret: SecretString) -> anyhow::Result<Self> {
        let upstream = SignedGatewayClient::new(
            &config.chat.gateway_url,
            shared_secret,
            Duration::from_secs(config.chat.gateway_timeout_secs),
        )?;
        Ok(Self::new(db_pool, config, upstream))
    }
}

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub provider: Arc<OpenAiProvider>,
    pub verifier: Arc<RequestVerifier>,
    /// The only model forwarded to the provider.
    pub model: String,
}

impl GatewayState {
    pub fn new(provider: OpenAiProvider, shared_secret: SecretString, config: &TallyConfig) -> Self {
        let nonces = Arc::new(InMemoryNonceStore::new(config.signing.nonce_ttl_secs));
        Self {
            provider: Arc::new(provider),
            verifier: Arc::new(RequestVerifier::new(shared_secret, config.signing.clock_skew_secs, nonces)),
            model: config.provider.model.clone(),
        }
    }

    pub fn init(
        config: &TallyConfig,
        shared_secret: SecretString,
        provider_api_key: Option<SecretString>,
    ) -> anyhow::Result<Self> {
        let provider = OpenAiProvider::new(
            &config.provider.base_url,
            provider_api_key,
            Duration::from_secs(config.provider.timeout_secs),
        )?;
        if !provider.has_api_key() {
            tracing::warn!("provider API key is not configured; chat calls will fail with missing_api_key");
        }
        Ok(Self::new(provider, shared_secret, config))
    }
}
