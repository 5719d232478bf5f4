//! Span names and field values shared by the product service and gateway.
//!
//! Span names are constants so log queries and dashboards have one place to
//! look them up.

// --- Span names ---

/// One client chat submission, from rate limiting to settlement.
pub const SPAN_CHAT_SUBMIT: &str = "chat.submit";

/// A streaming relay between upstream and the client.
pub const SPAN_CHAT_RELAY: &str = "chat.relay";

/// A gateway `POST /v1/chat` call.
pub const SPAN_GATEWAY_CHAT: &str = "gateway.chat";

/// An administrative ledger operation run from the CLI.
pub const SPAN_LEDGER_ADMIN: &str = "ledger.admin";

// --- Relay outcome values (`outcome` field) ---

pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_DISCONNECTED: &str = "disconnected";
pub const OUTCOME_REPLAYED: &str = "replayed";

// --- Header names ---

pub const REQUEST_ID_HEADER: &str = "x-request-id";
