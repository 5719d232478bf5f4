//! Streaming relay: upstream events in, client frames out.
//!
//! The client side is an `mpsc` channel whose receiver backs the SSE
//! response. When the client goes away the receiver is dropped, which the
//! relay notices before pulling the next upstream event. It then stops and
//! drops the upstream stream, closing that connection without draining it.

use futures_util::{Stream, StreamExt};
use tally_types::error::UpstreamError;
use tally_types::upstream::{RelayEvent, UpstreamEvent, UpstreamReply};
use tokio::sync::mpsc;
use tracing::debug;

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed(UpstreamReply),
    /// Upstream failed; `partial` is what had been forwarded.
    Failed { partial: String, error: UpstreamError },
    /// The client stopped listening; `partial` is what it had received.
    Disconnected { partial: String },
}

impl RelayOutcome {
    /// Text produced before the stream ended, whatever the reason.
    pub fn text(&self) -> &str {
        match self {
            RelayOutcome::Completed(reply) => &reply.text,
            RelayOutcome::Failed { partial, .. } | RelayOutcome::Disconnected { partial } => partial,
        }
    }
}

/// Forward `upstream` into `sink` until a terminal event or disconnect.
///
/// - deltas are sent, then appended to the buffer;
/// - a final frame with empty text falls back to the buffer;
/// - an upstream error is forwarded as an `error` frame;
/// - an upstream that ends without a final frame yields a synthetic final
///   from the buffer, or a `malformed_stream` error if nothing arrived.
pub async fn relay<S>(upstream: S, sink: &mpsc::Sender<RelayEvent>) -> RelayOutcome
where
    S: Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut buffer = String::new();

    loop {
        if sink.is_closed() {
            debug!(buffered = buffer.len(), "client disconnected, abandoning upstream");
            return RelayOutcome::Disconnected { partial: buffer };
        }

        match upstream.next().await {
            Some(Ok(UpstreamEvent::Delta(text))) => {
                if text.is_empty() {
                    continue;
                }
                if sink.send(RelayEvent::Delta { text: text.clone() }).await.is_err() {
                    return RelayOutcome::Disconnected { partial: buffer };
                }
                buffer.push_str(&text);
            }
            Some(Ok(UpstreamEvent::Final(reply))) => {
                let text = if reply.text.is_empty() { buffer } else { reply.text };
                let _ = sink
                    .send(RelayEvent::Final {
                        text: text.clone(),
                        usage: reply.usage.clone(),
                    })
                    .await;
                return RelayOutcome::Completed(UpstreamReply {
                    text,
                    usage: reply.usage,
                });
            }
            Some(Err(error)) => {
                let _ = sink.send(RelayEvent::Error(error.clone())).await;
                return RelayOutcome::Failed { partial: buffer, error };
            }
            None => break,
        }
    }

    if buffer.is_empty() {
        let error = UpstreamError::malformed_stream("upstream closed without producing output");
        let _ = sink.send(RelayEvent::Error(error.clone())).await;
        return RelayOutcome::Failed { partial: buffer, error };
    }

    let _ = sink
        .send(RelayEvent::Final {
            text: buffer.clone(),
            usage: None,
        })
        .await;
    RelayOutcome::Completed(UpstreamReply {
        text: buffer,
        usage: None,
    })
}
