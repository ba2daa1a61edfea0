//! Directory resolution and layered configuration.
//!
//! Every fabric process resolves its well-known directories and loads one
//! merged, read-only configuration snapshot at bootstrap. Later layers
//! override earlier ones: built-in defaults, the shared machine document,
//! the agent-group document, `FABRIC_*` environment variables, and finally
//! command-line arguments.

#![warn(missing_docs, clippy::pedantic)]

mod loader;
mod paths;
mod watch;

/// The merged configuration snapshot and its loader.
pub use loader::{Config, ConfigError, ConfigLoader, ConfigResult, ENV_PREFIX, parse_duration};
/// Well-known directory resolution.
pub use paths::FabricPaths;
/// Advisory change watching over loaded configuration sources.
pub use watch::ConfigWatcher;
