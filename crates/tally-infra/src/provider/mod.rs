//! Language-model provider client used by the gateway.

pub mod openai;
pub(crate) mod streaming;

pub use openai::OpenAiProvider;
