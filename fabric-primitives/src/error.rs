//! Shared error definitions for fabric primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the primitive types.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or parsing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// An agent or machine name failed validation.
    #[error("invalid name `{name}`: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// An instance identifier could not be parsed.
    #[error("invalid instance id: {source}")]
    InvalidInstanceId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// An endpoint address string could not be parsed.
    #[error("invalid endpoint `{address}`: {reason}")]
    InvalidEndpoint {
        /// The offending address string.
        address: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// An error event failed validation.
    #[error("invalid error event: {reason}")]
    InvalidEvent {
        /// Human-readable reason for rejection.
        reason: String,
    },
}
