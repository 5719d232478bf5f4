//! SignedGatewayClient -- `ChatUpstream` over the gateway's `POST /v1/chat`.
//!
//! Every call carries the HMAC signature headers. Streaming responses are
//! `event:`/`data:` SSE frames (`delta`, `final`, `error`) decoded with
//! `eventsource-stream`.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use secrecy::SecretString;
use serde::Deserialize;
use tally_core::upstream::{ChatUpstream, UpstreamStream};
use tally_types::error::UpstreamError;
use tally_types::upstream::{GatewayChatRequest, UpstreamEvent, UpstreamReply};
use tracing::{debug, warn};

use super::current_request_id;
use crate::security::SignedHeaders;

pub const CHAT_PATH: &str = "/v1/chat";

/// Signs and sends chat requests to the gateway.
pub struct SignedGatewayClient {
    client: reqwest::Client,
    base_url: String,
    secret: SecretString,
    /// Longest wait for the next response chunk.
    read_timeout: Duration,
}

/// `{"error": {...}}` body returned by the gateway on failure.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: UpstreamError,
}

impl SignedGatewayClient {
    pub fn new(base_url: &str, secret: SecretString, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            read_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Build the signed POST. The body is serialized once so the bytes that
    /// are hashed are the bytes that are sent.
    fn signed_post(&self, request: &GatewayChatRequest) -> Result<reqwest::RequestBuilder, UpstreamError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| UpstreamError::gateway_unreachable(format!("failed to encode request: {e}")))?;
        let headers = SignedHeaders::build(&self.secret, "POST", CHAT_PATH, &body, chrono::Utc::now().timestamp())
            .map_err(|e| UpstreamError::gateway_unreachable(format!("failed to sign request: {e}")))?;

        let mut builder = self
            .client
            .post(self.url(CHAT_PATH))
            .header("content-type", "application/json");
        for (name, value) in headers.pairs() {
            builder = builder.header(name, value);
        }
        if let Some(request_id) = current_request_id() {
            builder = builder.header("x-request-id", request_id);
        }
        Ok(builder.body(body))
    }
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout()
    } else {
        UpstreamError::gateway_unreachable(format!("gateway request failed: {e}"))
    }
}

/// Map a non-success gateway response to its normalized error.
pub(crate) fn error_from_body(status: u16, body: &str) -> UpstreamError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => UpstreamError {
            status,
            ..envelope.error
        },
        Err(_) => {
            warn!(status, body = %body, "gateway returned unparseable error body");
            UpstreamError::unparsed(status)
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaFrame {
    text: String,
}

/// Decode one SSE frame. Unknown event names are skipped.
pub(crate) fn decode_frame(event: &str, data: &str) -> Option<Result<UpstreamEvent, UpstreamError>> {
    let malformed = |e: serde_json::Error| UpstreamError::malformed_stream(format!("bad '{event}' frame: {e}"));
    match event {
        "delta" => Some(
            serde_json::from_str::<DeltaFrame>(data)
                .map(|d| UpstreamEvent::Delta(d.text))
                .map_err(malformed),
        ),
        "final" => Some(
            serde_json::from_str::<UpstreamReply>(data)
                .map(UpstreamEvent::Final)
                .map_err(malformed),
        ),
        "error" => Some(match serde_json::from_str::<UpstreamError>(data) {
            Ok(err) => Err(err),
            Err(e) => Err(malformed(e)),
        }),
        _ => None,
    }
}

impl ChatUpstream for SignedGatewayClient {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn complete(&self, request: &GatewayChatRequest) -> Result<UpstreamReply, UpstreamError> {
        let mut request = request.clone();
        request.stream = false;

        let response = self
            .signed_post(&request)?
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }

        response
            .json::<UpstreamReply>()
            .await
            .map_err(|e| UpstreamError::malformed_stream(format!("bad gateway response: {e}")))
    }

    fn stream(&self, mut request: GatewayChatRequest) -> UpstreamStream {
        request.stream = true;
        let builder = self.signed_post(&request);
        let read_timeout = self.read_timeout;

        Box::pin(async_stream::try_stream! {
            let response = tokio::time::timeout(read_timeout, builder?.send())
                .await
                .map_err(|_| UpstreamError::timeout())?
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                Err::<(), UpstreamError>(error_from_body(status.as_u16(), &body))?;
                return;
            }

            let mut events = response.bytes_stream().eventsource();
            loop {
                let next = tokio::time::timeout(read_timeout, events.next())
                    .await
                    .map_err(|_| UpstreamError::timeout())?;
                let Some(frame) = next else { break };
                let frame = frame.map_err(|e| UpstreamError::malformed_stream(format!("gateway stream: {e}")))?;

                match decode_frame(&frame.event, &frame.data) {
                    Some(item) => yield item?,
                    None => debug!(event = %frame.event, "ignoring unknown gateway frame"),
                }
            }
        })
    }
}
