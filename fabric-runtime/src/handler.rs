//! The interface concrete agents implement.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_net::wire::{ErrorBody, fault};
use fabric_primitives::ComponentHealth;
use thiserror::Error;

use crate::context::AgentContext;

/// Result alias for handler callbacks.
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Errors returned from agent callbacks.
///
/// Request-handler errors surface to the caller as
/// `{status: "error", kind, message, context?}` and are mirrored onto the
/// error bus by the runtime.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request exceeded the configured size limit.
    #[error("request of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Observed request size.
        size: usize,
        /// Applicable limit.
        limit: usize,
    },
    /// The request could not be understood.
    #[error("malformed request: {reason}")]
    BadRequest {
        /// What was wrong with it.
        reason: String,
    },
    /// Domain-specific handler failure.
    #[error("{kind}: {message}")]
    Failed {
        /// Machine-readable kind token.
        kind: String,
        /// Human-readable message.
        message: String,
        /// Optional extra context.
        context: BTreeMap<String, String>,
    },
}

impl HandlerError {
    /// Creates a domain failure with the given kind token.
    #[must_use]
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Creates a malformed-request failure.
    #[must_use]
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Renders the error as a wire reply body.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::MessageTooLarge { .. } => {
                ErrorBody::new(fault::MESSAGE_TOO_LARGE, self.to_string())
            }
            Self::BadRequest { reason } => ErrorBody::new(fault::BAD_REQUEST, reason.clone()),
            Self::Failed {
                kind,
                message,
                context,
            } => {
                let mut body = ErrorBody::new(kind.clone(), message.clone());
                body.context.clone_from(context);
                body
            }
        }
    }
}

/// Behaviour supplied by a concrete agent.
///
/// The runtime owns the process lifecycle; an agent implements these hooks
/// and nothing else. Request payloads are opaque bytes: the runtime frames
/// and transports them without interpretation.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Called once after configuration is loaded and endpoints are
    /// acquired. Returning an error aborts startup with a non-zero exit.
    ///
    /// # Errors
    ///
    /// Any error fails startup.
    async fn on_start(&self, ctx: &AgentContext) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }

    /// Called for each message arriving on the request endpoint. The
    /// returned bytes are sent back verbatim as the reply.
    ///
    /// # Errors
    ///
    /// Errors are sent to the caller as a structured error reply and
    /// published on the error bus.
    async fn on_request(&self, ctx: &AgentContext, payload: Bytes) -> HandlerResult<Vec<u8>>;

    /// Called once during graceful shutdown, before background tasks are
    /// joined.
    ///
    /// # Errors
    ///
    /// Errors are logged and reported; shutdown proceeds regardless.
    async fn on_stop(&self, ctx: &AgentContext) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }

    /// Contributes named component checks to health snapshots, merged with
    /// the runtime's built-in `self`, `endpoints`, and `registry` checks.
    /// Must return promptly; the health loop calls it under its probe
    /// deadline.
    fn health_components(&self) -> Vec<(String, ComponentHealth)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_renders_kind_and_context() {
        let err = HandlerError::Failed {
            kind: "model_load".into(),
            message: "weights missing".into(),
            context: BTreeMap::from([("path".to_string(), "/models/tts".to_string())]),
        };
        let body = err.to_body();
        assert_eq!(body.kind, "model_load");
        assert_eq!(body.context.get("path").map(String::as_str), Some("/models/tts"));
    }

    #[test]
    fn oversize_maps_to_wire_kind() {
        let err = HandlerError::MessageTooLarge {
            size: 17,
            limit: 16,
        };
        assert_eq!(err.to_body().kind, fault::MESSAGE_TOO_LARGE);
    }
}
