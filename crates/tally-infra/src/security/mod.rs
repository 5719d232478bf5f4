//! Signed internal requests between the product service and the gateway.

pub mod signature;

pub use signature::{RequestVerifier, SignatureHeaders, SignedHeaders};
