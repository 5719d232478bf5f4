//! Configuration types for Tally.
//!
//! `TallyConfig` is the top-level `config.toml`. Every field has a default so
//! an empty (or missing) file yields a working local setup. Secrets are not
//! part of this file; they come from the environment (see `tally-infra`).

use serde::{Deserialize, Serialize};

/// Top-level configuration shared by the product service and the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_product_bind")]
    pub product_bind: String,
    #[serde(default = "default_gateway_bind")]
    pub gateway_bind: String,
    /// Overrides the data-dir default `sqlite://{data_dir}/tally.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_product_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_gateway_bind() -> String {
    "127.0.0.1:8100".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            product_bind: default_product_bind(),
            gateway_bind: default_gateway_bind(),
            database_url: None,
        }
    }
}

/// Signed internal request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Maximum `|now - X-Timestamp|` in seconds.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: i64,
    /// How long a seen nonce is remembered.
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: i64,
}

fn default_clock_skew_secs() -> i64 {
    60
}

fn default_nonce_ttl_secs() -> i64 {
    300
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew_secs(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
        }
    }
}

/// Per-dimension sliding-window thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_company_per_window")]
    pub company_per_window: usize,
    #[serde(default = "default_user_per_window")]
    pub user_per_window: usize,
    #[serde(default = "default_ip_per_window")]
    pub ip_per_window: usize,
}

fn default_window_secs() -> u64 {
    60
}

fn default_company_per_window() -> usize {
    60
}

fn default_user_per_window() -> usize {
    30
}

fn default_ip_per_window() -> usize {
    120
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            company_per_window: default_company_per_window(),
            user_per_window: default_user_per_window(),
            ip_per_window: default_ip_per_window(),
        }
    }
}

/// Product-side chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Completed messages sent upstream as context.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_credits_per_message")]
    pub credits_per_message: i64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
}

fn default_context_limit() -> usize {
    20
}

fn default_max_message_chars() -> usize {
    4000
}

fn default_credits_per_message() -> i64 {
    1
}

fn default_model() -> String {
    "gpt-5.2".to_string()
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8100".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_limit: default_context_limit(),
            max_message_chars: default_max_message_chars(),
            credits_per_message: default_credits_per_message(),
            model: default_model(),
            gateway_url: default_gateway_url(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Gateway-side provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// The only model the gateway forwards.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_provider_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            timeout_secs: default_provider_timeout_secs(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TallyConfig = toml::from_str("").unwrap();
        assert_eq!(config.signing.clock_skew_secs, 60);
        assert_eq!(config.signing.nonce_ttl_secs, 300);
        assert_eq!(config.chat.context_limit, 20);
        assert_eq!(config.chat.max_message_chars, 4000);
        assert_eq!(config.chat.model, "gpt-5.2");
        assert_eq!(config.rate_limits.company_per_window, 60);
        assert_eq!(config.rate_limits.user_per_window, 30);
        assert_eq!(config.rate_limits.ip_per_window, 120);
        assert_eq!(config.provider.timeout_secs, 30);
        assert!(config.server.database_url.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
[signing]
clock_skew_secs = 15

[chat]
context_limit = 4
gateway_url = "http://gateway.internal:9000"

[log]
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.signing.clock_skew_secs, 15);
        assert_eq!(config.signing.nonce_ttl_secs, 300);
        assert_eq!(config.chat.context_limit, 4);
        assert_eq!(config.chat.max_message_chars, 4000);
        assert_eq!(config.chat.gateway_url, "http://gateway.internal:9000");
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }
}
