//! The fabric's service directory.
//!
//! Maps logical agent names to endpoints through two interchangeable
//! backends: an in-memory map for single-machine deployments and tests, and
//! a Redis-backed store with TTL expiry for multi-machine fabrics. The
//! registry serves its own reply endpoint speaking the wire actions
//! `register`, `deregister`, `lookup`, `list`, and `heartbeat`.

#![warn(missing_docs, clippy::pedantic)]

mod backend;
mod entry;
mod memory;
pub mod protocol;
mod service;
mod store;

/// Backend abstraction shared by both storage engines.
pub use backend::{BackendError, BackendResult, RegistryBackend};
/// A single registration: name, endpoints, capability tags, metadata.
pub use entry::ServiceEntry;
/// In-memory backend without TTL.
pub use memory::InMemoryBackend;
/// The reply-endpoint service wrapping a backend.
pub use service::{RegistryService, RegistryServiceConfig};
/// Redis-backed external store with TTL refresh.
pub use store::RedisBackend;
