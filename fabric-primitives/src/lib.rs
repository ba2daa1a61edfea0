//! Core shared types for AgentFabric processes.
//!
//! Everything that crosses a crate boundary more than once lives here: agent
//! and machine identifiers, endpoint addresses, health snapshots, and the
//! error events carried by the bus.

#![warn(missing_docs, clippy::pedantic)]

mod endpoint;
mod error;
mod event;
mod health;
mod ids;

/// Transport-level addresses for fabric endpoints.
pub use endpoint::EndpointAddress;
/// Error type and result alias shared across the fabric.
pub use error::{Error, Result};
/// Structured error events and the bus topic grammar.
pub use event::{ErrorEvent, ErrorEventBuilder, Severity, topic};
/// Health snapshots produced by agents on demand.
pub use health::{ComponentHealth, HealthSnapshot, HealthStatus};
/// Validated identifiers for agents, machines, and process instances.
pub use ids::{AgentName, InstanceId, MachineId};
