//! Request middleware shared by the product API and the gateway.

pub mod request_id;
pub mod signature;
