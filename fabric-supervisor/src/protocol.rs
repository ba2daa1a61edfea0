//! Operator query protocol served by the supervisor.

use fabric_net::wire::ErrorBody;
use serde::{Deserialize, Serialize};

use crate::record::AgentState;

/// Requests accepted on the supervisor's query endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorRequest {
    /// List every agent record's state.
    Status {},
    /// Gracefully stop one agent (no restart until started again).
    StopAgent {
        /// Agent to stop.
        name: String,
    },
    /// Start a stopped or failed agent.
    StartAgent {
        /// Agent to start.
        name: String,
    },
}

/// One agent's state as reported to operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Agent name.
    pub name: String,
    /// Current state token.
    pub state: AgentState,
    /// OS process id, when running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the current process was spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    /// Restarts consumed within the current window.
    pub restarts_in_window: u32,
    /// Consecutive failed probes.
    pub probe_failures: u32,
}

/// Reply to a `status` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReply {
    /// Snapshot of all records.
    Ok {
        /// Group being supervised.
        group: String,
        /// Per-agent states.
        agents: Vec<AgentStatus>,
    },
    /// The request failed.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Acknowledgement for `stop_agent` / `start_agent`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    /// Command accepted.
    Ok {},
    /// Command rejected.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_net::wire;

    #[test]
    fn status_round_trips() {
        let reply = StatusReply::Ok {
            group: "core".into(),
            agents: vec![AgentStatus {
                name: "model-manager".into(),
                state: AgentState::Ready,
                pid: Some(4242),
                uptime_seconds: Some(17),
                restarts_in_window: 1,
                probe_failures: 0,
            }],
        };
        let bytes = wire::encode(&reply).unwrap();
        let decoded: StatusReply = wire::decode(&bytes).unwrap();
        let StatusReply::Ok { group, agents } = decoded else {
            panic!("expected ok");
        };
        assert_eq!(group, "core");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].state, AgentState::Ready);
    }
}
