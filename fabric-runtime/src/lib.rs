//! Per-process runtime for AgentFabric agents.
//!
//! Concrete agents implement the small [`Agent`] trait; the runtime owns
//! everything else: configuration, endpoint acquisition, the request loop
//! (serialized, or overlapping for agents that opt into reentrancy), the
//! isolated health loop, tracked background tasks, rate-limited error
//! reporting, registration, and graceful shutdown with documented exit
//! codes.

#![warn(missing_docs, clippy::pedantic)]

mod context;
mod handler;
mod lifecycle;
pub mod protocol;
mod reporter;
mod runtime;
mod tasks;

/// Context object passed to every agent callback.
pub use context::AgentContext;
/// The trait concrete agents implement, and its error type.
pub use handler::{Agent, HandlerError, HandlerResult};
/// Lifecycle state machine shared with embedding processes.
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleResult, RuntimeEvent, RuntimeState};
/// Rate-limited error publication.
pub use reporter::ErrorReporter;
/// The process driver and its options.
pub use runtime::{
    AgentRuntime, EXIT_CONFIG, EXIT_INTERNAL, EXIT_OK, EXIT_REQUIRED, RuntimeError,
    RuntimeOptions, RuntimeResult,
};
/// Tracked background tasks.
pub use tasks::{TaskError, TaskRegistry};
