//! Registry client library linked by every agent.
//!
//! Wraps the registry's wire protocol with a bounded lookup cache,
//! exponential-backoff retry for transient failures, and a background
//! heartbeat worker for TTL-based backends.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod registration;

/// The cached, retrying registry client.
pub use client::{DiscoveryClient, DiscoveryConfig, DiscoveryError, DiscoveryResult, RetryPolicy};
/// Handle over the background registration/heartbeat worker.
pub use registration::Registration;
