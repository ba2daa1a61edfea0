//! Wire protocol of the twin's query endpoint.

use chrono::{DateTime, Utc};
use fabric_net::wire::ErrorBody;
use fabric_primitives::{ErrorEvent, Severity};
use serde::{Deserialize, Serialize};

use crate::view::TwinEntry;

/// Requests accepted on the twin's query endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TwinRequest {
    /// Fetch one agent's entry.
    Status {
        /// Agent name.
        name: String,
        /// Machine, when the same name exists on both.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        machine: Option<String>,
    },
    /// Fetch every entry.
    StatusAll {},
    /// Fetch recent error events with optional filters.
    RecentErrors {
        /// Restrict to one agent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Only events at or after this time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<DateTime<Utc>>,
        /// Only events at or above this severity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        severity: Option<Severity>,
    },
}

/// Reply to `status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReply {
    /// Entry found.
    Ok {
        /// The matching entry.
        entry: TwinEntry,
    },
    /// No such agent, or the request was malformed.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Reply to `status_all`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusAllReply {
    /// Snapshot of every entry.
    Ok {
        /// All entries, ordered by `(machine, agent)`.
        entries: Vec<TwinEntry>,
    },
    /// The request failed.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Reply to `recent_errors`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecentErrorsReply {
    /// Matching events, oldest first.
    Ok {
        /// The events.
        events: Vec<ErrorEvent>,
    },
    /// The request failed.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Topic prefix under which the twin broadcasts health transitions.
pub const TRANSITION_TOPIC_PREFIX: &str = "twin.transition.";

/// Full transition topic for one agent.
#[must_use]
pub fn transition_topic(machine: &str, agent: &str) -> String {
    format!("{TRANSITION_TOPIC_PREFIX}{machine}.{agent}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_net::wire;

    #[test]
    fn requests_round_trip() {
        let request = TwinRequest::RecentErrors {
            name: Some("asr".into()),
            since: None,
            severity: Some(Severity::Error),
        };
        let bytes = wire::encode(&request).unwrap();
        let decoded: TwinRequest = wire::decode(&bytes).unwrap();
        assert!(matches!(decoded, TwinRequest::RecentErrors { .. }));
    }

    #[test]
    fn transition_topics_nest_under_prefix() {
        let topic = transition_topic("pc2", "vision-capture");
        assert!(topic.starts_with(TRANSITION_TOPIC_PREFIX));
        assert_eq!(topic, "twin.transition.pc2.vision-capture");
    }
}
