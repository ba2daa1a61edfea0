//! Cross-machine error bus and digital-twin aggregation.
//!
//! Two roles live here. The [`ErrorBus`] is the rendezvous broker agents
//! publish structured error events to; it re-broadcasts them best-effort
//! under the `err.<severity>.<machine>.<agent>` topic grammar. The
//! [`DigitalTwin`] subscribes to the bus, probes every registry-listed
//! agent with `full` probes, and serves a live per-agent view to
//! operators.

#![warn(missing_docs, clippy::pedantic)]

mod bus;
pub mod protocol;
mod service;
mod view;

/// The SUB-to-PUB broker and its configuration.
pub use bus::{ErrorBus, ErrorBusConfig, all_events_prefix};
/// The aggregator service.
pub use service::{DigitalTwin, TwinServiceConfig};
/// The in-memory view, derived status, and transitions.
pub use view::{DerivedStatus, HealthTransition, TwinConfig, TwinEntry, TwinView, derive_status};
