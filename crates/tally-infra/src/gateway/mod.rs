//! Product-side client for the internal chat gateway.

pub mod client;

pub use client::SignedGatewayClient;

tokio::task_local! {
    /// Request id of the inbound request being served, forwarded to the
    /// gateway as `X-Request-ID`.
    pub static CURRENT_REQUEST_ID: String;
}

/// The request id in scope, if any.
pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST_ID.try_with(Clone::clone).ok()
}
