//! Dependency-aware process supervisor for AgentFabric groups.
//!
//! Reads a declarative group manifest, computes a deterministic dependency
//! order, spawns agents with captured logs, probes their health endpoints,
//! restarts them under a windowed budget with backoff, and tears the group
//! down in reverse order on shutdown.

#![warn(missing_docs, clippy::pedantic)]

mod graph;
mod manifest;
mod probe;
mod process;
pub mod protocol;
mod record;
mod supervisor;

/// Topological ordering over descriptors.
pub use graph::topological_order;
/// Manifest types and validation.
pub use manifest::{AgentDescriptor, GroupManifest, ManifestError, ManifestResult, RestartPolicy};
/// Health probing of supervised agents.
pub use probe::{ProbeClient, ProbeError, ProbeResult};
/// Child spawning with log capture.
pub use process::{SpawnContext, spawn_agent};
/// Per-agent runtime bookkeeping.
pub use record::{AgentRecord, AgentState, RestartTracker};
/// The supervision loop.
pub use supervisor::{Supervisor, SupervisorPolicies};
