//! ChatUpstream trait definition.
//!
//! Both hops of the upstream leg implement this trait: the product service's
//! signed client for the gateway, and the gateway's provider client. The
//! relay and the chat service only ever see normalized [`UpstreamEvent`]s and
//! [`UpstreamError`]s.

use std::pin::Pin;

use futures_util::Stream;
use tally_types::error::UpstreamError;
use tally_types::upstream::{GatewayChatRequest, UpstreamEvent, UpstreamReply};

/// A normalized upstream event stream.
///
/// Dropping the stream closes the underlying connection.
pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send + 'static>>;

/// A completion backend reachable over the network.
///
/// Implementations live in tally-infra (`SignedGatewayClient`,
/// `OpenAiProvider`).
pub trait ChatUpstream: Send + Sync {
    /// Short name used in logs ("gateway", "openai").
    fn name(&self) -> &str;

    /// Single-shot completion.
    fn complete(
        &self,
        request: &GatewayChatRequest,
    ) -> impl std::future::Future<Output = Result<UpstreamReply, UpstreamError>> + Send;

    /// Streaming completion. Connection failures arrive as the first item.
    ///
    /// Returns a boxed stream (not RPITIT) so it can be moved into a spawned
    /// relay task.
    fn stream(&self, request: GatewayChatRequest) -> UpstreamStream;
}
