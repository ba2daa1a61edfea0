//! Backend abstraction for the registry's storage engines.

use async_trait::async_trait;
use fabric_primitives::AgentName;
use thiserror::Error;

use crate::entry::ServiceEntry;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by registry backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The entry failed validation.
    #[error("invalid entry: {reason}")]
    InvalidEntry {
        /// Human-readable reason.
        reason: String,
    },
    /// A different owner already claims the request endpoint.
    #[error("request endpoint {endpoint} already claimed by `{owner}`")]
    Conflict {
        /// The contested endpoint address.
        endpoint: String,
        /// Name of the current owner.
        owner: String,
    },
    /// No entry exists for the name.
    #[error("no entry for `{name}`")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },
    /// The backend store is temporarily unreachable.
    #[error("backend unavailable: {detail}")]
    Unavailable {
        /// Transport-level detail.
        detail: String,
    },
    /// The backend store failed in a non-transient way.
    #[error("backend failure: {detail}")]
    Backend {
        /// Failure detail.
        detail: String,
    },
}

/// Storage engine behind the registry service.
///
/// `register` is an upsert with last-writer-wins semantics per name.
/// Lookups never observe partial writes; writes for one name are
/// linearizable against subsequent reads from the same backend instance.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Upserts an entry by name.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Conflict`] when a different name claims the
    /// same request `(host, port)`, or a store error.
    async fn register(&self, entry: ServiceEntry) -> BackendResult<()>;

    /// Removes an entry by name. Removing an absent name succeeds.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    async fn deregister(&self, name: &AgentName) -> BackendResult<()>;

    /// Fetches one entry.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when absent, or a store error.
    async fn lookup(&self, name: &AgentName) -> BackendResult<ServiceEntry>;

    /// Returns a consistent snapshot of entries, optionally filtered by
    /// capability tag.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    async fn list(&self, capability: Option<&str>) -> BackendResult<Vec<ServiceEntry>>;

    /// Refreshes an entry's TTL where the backend supports expiry.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when the entry has expired, so the
    /// owner knows to re-register, or a store error.
    async fn heartbeat(&self, name: &AgentName) -> BackendResult<()>;
}
