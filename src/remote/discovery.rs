use async_trait::async_trait;

use super::Affinity;
use crate::error::EngineError;

/// Outcome of one discovery round-trip for a single address.
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    /// The address resolved to a backend partition.
    Resolved(Affinity),
    /// The directory pointed at another discovery endpoint.
    Redirect(String),
    /// The directory asked us to back off and try again later.
    Busy,
}

/// Mailbox directory protocol: user discovery and distribution-group
/// expansion.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// One discovery attempt for a single address against the given
    /// endpoint. Permanently unresolvable addresses surface as
    /// [`EngineError::UnknownUser`].
    ///
    /// The surface is per-address because redirects and busy responses
    /// apply to individual addresses: one mailbox of a batch may bounce to
    /// another discovery endpoint while the rest resolve in place. Callers
    /// that hold a list of addresses chunk it and drive one resolution
    /// chase per address, collecting partial results; an implementation
    /// backed by a batch-shaped wire call can still coalesce adjacent
    /// requests internally.
    async fn resolve_user(
        &self,
        service_account: &str,
        discovery_url: &str,
        email: &str,
    ) -> Result<DiscoveryOutcome, EngineError>;

    /// Expand a named distribution group into member addresses.
    async fn expand_group(
        &self,
        service_account: &str,
        group_name: &str,
    ) -> Result<Vec<String>, EngineError>;
}
