//! Wire shapes served by every agent's endpoints.

use fabric_net::wire::ErrorBody;
use serde::{Deserialize, Serialize};

use crate::handler::HandlerError;

/// Probes accepted on the health endpoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum ProbeRequest {
    /// Minimal liveness probe; answered from cached state.
    Ping {},
    /// Full snapshot probe; runs the component checks.
    Full {},
}

/// Control messages accepted on the health endpoint.
///
/// The supervisor prefers a control `stop` over OS termination so agents on
/// remote machines shut down identically to local ones.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Begin graceful shutdown, equivalent to SIGTERM.
    Stop {},
}

/// Reply to a `ping` probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingReply {
    /// Always `"ok"` while the process can answer at all.
    pub status: String,
    /// Seconds since the agent finished startup.
    pub uptime_seconds: u64,
}

impl PingReply {
    /// A healthy ping reply.
    #[must_use]
    pub fn ok(uptime_seconds: u64) -> Self {
        Self {
            status: "ok".into(),
            uptime_seconds,
        }
    }

    /// Returns `true` when the reply signals liveness.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Acknowledgement for a control request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlReply {
    /// Always `"ok"`; the stop itself proceeds asynchronously.
    pub status: String,
}

impl ControlReply {
    /// A positive acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

/// Error reply sent by the runtime when a request handler fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Always `"error"`.
    pub status: String,
    /// The `{kind, message, context?}` body.
    #[serde(flatten)]
    pub fault: ErrorBody,
}

impl ErrorReply {
    /// Renders a handler error for the wire.
    #[must_use]
    pub fn from_handler(error: &HandlerError) -> Self {
        Self {
            status: "error".into(),
            fault: error.to_body(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_net::wire;

    #[test]
    fn probe_shapes_round_trip() {
        let bytes = wire::encode(&ProbeRequest::Ping {}).unwrap();
        assert!(matches!(
            wire::decode::<ProbeRequest>(&bytes).unwrap(),
            ProbeRequest::Ping {}
        ));

        let bytes = wire::encode(&ProbeRequest::Full {}).unwrap();
        assert!(matches!(
            wire::decode::<ProbeRequest>(&bytes).unwrap(),
            ProbeRequest::Full {}
        ));
    }

    #[test]
    fn control_stop_is_distinct_from_probes() {
        let bytes = wire::encode(&ControlRequest::Stop {}).unwrap();
        assert!(wire::decode::<ProbeRequest>(&bytes).is_err());
        assert!(matches!(
            wire::decode::<ControlRequest>(&bytes).unwrap(),
            ControlRequest::Stop {}
        ));
    }

    #[test]
    fn error_reply_carries_fault_fields_flat() {
        let error = HandlerError::failed("model_load", "weights missing");
        let reply = ErrorReply::from_handler(&error);
        let bytes = wire::encode(&reply).unwrap();
        let decoded: ErrorReply = wire::decode(&bytes).unwrap();
        assert_eq!(decoded.status, "error");
        assert_eq!(decoded.fault.kind, "model_load");
    }
}
