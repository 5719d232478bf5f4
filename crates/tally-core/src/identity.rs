//! SessionResolver trait definition.
//!
//! Sessions are issued elsewhere; this port only turns a presented bearer
//! token into the verified [`Principal`] for the request.

use tally_types::error::RepositoryError;
use tally_types::identity::Principal;

pub trait SessionResolver: Send + Sync {
    /// Resolve a raw bearer token. `Ok(None)` means unknown or expired.
    fn resolve(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<Principal>, RepositoryError>> + Send;
}
