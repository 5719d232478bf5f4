//! OpenAiProvider -- `ChatUpstream` over an OpenAI-compatible
//! `/chat/completions` endpoint.
//!
//! Used by the gateway. The API key is optional at construction: a gateway
//! started without one still serves `/health` and answers every chat call
//! with a non-retryable `missing_api_key` (503).

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tally_core::upstream::{ChatUpstream, UpstreamStream};
use tally_types::error::UpstreamError;
use tally_types::upstream::{ContextMessage, GatewayChatRequest, UpstreamReply};
use tracing::warn;

use super::streaming::{completion_events, error_fields};

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ContextMessage],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl<'a> CompletionsRequest<'a> {
    fn new(request: &'a GatewayChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }
}

// OpenAiProvider does not derive Debug; the key only leaves the SecretString
// when the Authorization header is built.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    base_url: String,
    default_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: Option<SecretString>, default_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_timeout,
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn timeout_for(&self, request: &GatewayChatRequest) -> Duration {
        request
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    fn authorized(&self, body: &CompletionsRequest<'_>) -> Result<reqwest::RequestBuilder, UpstreamError> {
        let key = self.api_key.as_ref().ok_or_else(UpstreamError::missing_api_key)?;
        Ok(self
            .client
            .post(self.url())
            .bearer_auth(key.expose_secret())
            .json(body))
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout()
    } else {
        UpstreamError::unavailable(e)
    }
}

/// Normalize a non-success provider response.
///
/// Retryability follows the status code only. A body that is not JSON is
/// logged raw and becomes a generic `upstream_error`.
pub(crate) fn provider_error(status: u16, body: &str) -> UpstreamError {
    match serde_json::from_str::<Value>(body) {
        Ok(payload) => {
            let (kind, code, message) = error_fields(payload.get("error"));
            UpstreamError::from_status(status, &kind, &code, &message)
        }
        Err(_) => {
            warn!(status, body = %body, "non-json upstream error");
            UpstreamError::unparsed(status)
        }
    }
}

/// Pull `(text, usage)` out of a non-streamed completion.
pub(crate) fn reply_from_completion(data: &Value) -> Result<UpstreamReply, UpstreamError> {
    let first = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(UpstreamError::empty_response)?;

    let text = first
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(UpstreamError::missing_content)?;

    Ok(UpstreamReply {
        text: text.to_string(),
        usage: data.get("usage").filter(|u| !u.is_null()).cloned(),
    })
}

impl ChatUpstream for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &GatewayChatRequest) -> Result<UpstreamReply, UpstreamError> {
        let body = CompletionsRequest::new(request, false);
        let response = self
            .authorized(&body)?
            .timeout(self.timeout_for(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(provider_error(status.as_u16(), &text));
        }

        let data: Value = response.json().await.map_err(transport_error)?;
        reply_from_completion(&data)
    }

    fn stream(&self, request: GatewayChatRequest) -> UpstreamStream {
        let builder = self.authorized(&CompletionsRequest::new(&request, true));
        let read_timeout = self.timeout_for(&request);

        Box::pin(async_stream::try_stream! {
            let response = tokio::time::timeout(read_timeout, builder?.send())
                .await
                .map_err(|_| UpstreamError::timeout())?
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                Err::<(), UpstreamError>(provider_error(status.as_u16(), &text))?;
                return;
            }

            for await event in completion_events(response.bytes_stream(), read_timeout) {
                yield event?;
            }
        })
    }
}
