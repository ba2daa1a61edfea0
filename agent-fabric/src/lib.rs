//! AgentFabric orchestration SDK facade.
//!
//! Depend on this crate via `cargo add agent-fabric`. It bundles the fabric
//! crates behind feature flags so an agent pulls in only the subsystems it
//! needs; most agents want the default set (runtime, transport, config,
//! discovery, telemetry).

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use fabric_primitives as primitives;

/// Layered configuration and path resolution (enabled by `config`).
#[cfg(feature = "config")]
pub use fabric_config as config;

/// Registry client library (enabled by `discovery`).
#[cfg(feature = "discovery")]
pub use fabric_discovery as discovery;

/// Pooled endpoints and the wire codec (enabled by `net`).
#[cfg(feature = "net")]
pub use fabric_net as net;

/// Service registry backends and service (enabled by `registry`).
#[cfg(feature = "registry")]
pub use fabric_registry as registry;

/// Per-process agent runtime (enabled by `runtime`).
#[cfg(feature = "runtime")]
pub use fabric_runtime as runtime;

/// Group supervisor (enabled by `supervisor`).
#[cfg(feature = "supervisor")]
pub use fabric_supervisor as supervisor;

/// Tracing bootstrap (enabled by `telemetry`).
#[cfg(feature = "telemetry")]
pub use fabric_telemetry as telemetry;

/// Error bus and digital twin (enabled by `twin`).
#[cfg(feature = "twin")]
pub use fabric_twin as twin;
