//! Request extractors for product API handlers.

pub mod auth;
pub mod context;
pub mod query;
