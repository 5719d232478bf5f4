//! Chat-completions SSE decoding.
//!
//! Framing is left to `eventsource-stream`. Each event's data is either
//! `[DONE]` or a JSON chunk that may carry a text delta in
//! `choices[0].delta.content`, a `usage` object (sent last when
//! `stream_options.include_usage` is set), or an `error` object.

use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tally_types::error::UpstreamError;
use tally_types::upstream::{UpstreamEvent, UpstreamReply};

use super::openai::transport_error;

/// What one event's data contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    Delta(String),
    Done,
    Skip,
}

/// Accumulates the reply across events.
#[derive(Debug, Default)]
pub(crate) struct StreamParser {
    text: String,
    usage: Option<Value>,
}

impl StreamParser {
    pub(crate) fn push_data(&mut self, data: &str) -> Result<ChunkOutcome, UpstreamError> {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(ChunkOutcome::Done);
        }

        // Partial garbage is not fatal.
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Ok(ChunkOutcome::Skip);
        };

        if let Some(error) = chunk.get("error") {
            return Err(embedded_error(error));
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }

        let delta = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if delta.is_empty() {
            return Ok(ChunkOutcome::Skip);
        }
        self.text.push_str(delta);
        Ok(ChunkOutcome::Delta(delta.to_string()))
    }

    /// The synthetic final reply: everything streamed plus the last usage.
    pub(crate) fn finish(self) -> UpstreamReply {
        UpstreamReply {
            text: self.text,
            usage: self.usage,
        }
    }
}

/// Decode a provider response body into upstream events.
///
/// Waits at most `read_timeout` for each event. Ends after `[DONE]` or when
/// the body closes, with a final event built from the accumulated deltas.
pub(crate) fn completion_events<S, B>(
    bytes: S,
    read_timeout: Duration,
) -> impl Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    async_stream::try_stream! {
        let mut parser = StreamParser::default();
        let mut events = Box::pin(bytes.eventsource());

        loop {
            let next = tokio::time::timeout(read_timeout, events.next())
                .await
                .map_err(|_| UpstreamError::timeout())?;
            let Some(event) = next else { break };
            let event = event.map_err(stream_error)?;

            match parser.push_data(&event.data)? {
                ChunkOutcome::Delta(text) => yield UpstreamEvent::Delta(text),
                ChunkOutcome::Done => break,
                ChunkOutcome::Skip => {}
            }
        }

        yield UpstreamEvent::Final(parser.finish());
    }
}

fn stream_error(e: EventStreamError<reqwest::Error>) -> UpstreamError {
    match e {
        EventStreamError::Transport(e) => transport_error(e),
        other => UpstreamError::malformed_stream(format!("provider stream: {other}")),
    }
}

/// Error object sent inside a stream that already answered 200.
///
/// A status (`status`, or a numeric `code`) and an explicit `retryable`
/// flag are honored when the provider sends them.
fn embedded_error(error: &Value) -> UpstreamError {
    let (kind, code, message) = error_fields(Some(error));
    let status = error
        .get("status")
        .and_then(Value::as_u64)
        .or_else(|| error.get("code").and_then(Value::as_u64))
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (400..600).contains(s));

    let mut err = match status {
        Some(status) => UpstreamError::from_status(status, &kind, &code, &message),
        None => UpstreamError::in_stream(&kind, &code, &message),
    };
    if let Some(retryable) = error.get("retryable").and_then(Value::as_bool) {
        err.retryable = retryable;
    }
    err
}

/// `(type, code, message)` from a provider `error` object, with fallbacks.
pub(crate) fn error_fields(error: Option<&Value>) -> (String, String, String) {
    let Some(error) = error.filter(|e| e.is_object()) else {
        return (
            "upstream_error".to_string(),
            "upstream_error".to_string(),
            "upstream error".to_string(),
        );
    };

    let kind = error
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("upstream_error")
        .to_string();
    let code = match error.get("code") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => kind.clone(),
    };
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("upstream error")
        .to_string();
    (kind, code, message)
}
