//! HTTP request handlers.

pub mod chat;
pub mod conversations;
pub mod gateway;
