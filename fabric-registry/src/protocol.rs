//! Wire-level request and reply shapes for the registry endpoint.

use fabric_net::wire::{ErrorBody, fault};
use fabric_primitives::AgentName;
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::entry::ServiceEntry;

/// Requests accepted on the registry's reply endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RegistryRequest {
    /// Upsert an entry by name.
    Register {
        /// The entry to store.
        entry: ServiceEntry,
    },
    /// Remove an entry by name; idempotent.
    Deregister {
        /// Name to remove.
        name: AgentName,
    },
    /// Fetch one entry by name.
    Lookup {
        /// Name to fetch.
        name: AgentName,
    },
    /// List entries, optionally filtered by capability tag.
    List {
        /// Capability tag filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
    },
    /// Refresh the TTL of an entry (external backend only).
    Heartbeat {
        /// Name to refresh.
        name: AgentName,
    },
}

/// Acknowledgement reply for `register`, `deregister`, and `heartbeat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckReply {
    /// The operation succeeded.
    Ok {},
    /// The operation failed.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

impl AckReply {
    /// Success acknowledgement.
    #[must_use]
    pub const fn ok() -> Self {
        Self::Ok {}
    }

    /// Returns `true` for the success variant.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok {})
    }
}

/// Reply for `lookup`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupReply {
    /// Entry found.
    Ok {
        /// The matching entry.
        entry: ServiceEntry,
    },
    /// Entry missing or backend failure.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Reply for `list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListReply {
    /// Consistent snapshot of matching entries.
    Ok {
        /// Matching entries.
        entries: Vec<ServiceEntry>,
    },
    /// Backend failure.
    Error {
        /// Error details.
        #[serde(flatten)]
        fault: ErrorBody,
    },
}

/// Maps a backend error to the `{kind, message}` wire body.
#[must_use]
pub fn fault_for(error: &BackendError) -> ErrorBody {
    match error {
        BackendError::InvalidEntry { reason } => ErrorBody::new(fault::INVALID_ENTRY, reason),
        BackendError::Conflict { endpoint, owner } => {
            ErrorBody::new(fault::CONFLICT, format!("endpoint {endpoint} already claimed"))
                .with_context("owner", owner)
        }
        BackendError::NotFound { name } => {
            ErrorBody::new(fault::NOT_FOUND, format!("no entry for `{name}`"))
        }
        BackendError::Unavailable { detail } => ErrorBody::new(fault::UNAVAILABLE, detail),
        BackendError::Backend { detail } => ErrorBody::new(fault::BACKEND_ERROR, detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_net::wire;
    use fabric_primitives::{EndpointAddress, InstanceId};

    fn entry() -> ServiceEntry {
        ServiceEntry::new(
            AgentName::new("tts").unwrap(),
            InstanceId::random(),
            EndpointAddress::new("127.0.0.1", 6000).unwrap(),
            EndpointAddress::new("127.0.0.1", 6001).unwrap(),
        )
    }

    #[test]
    fn request_round_trips_with_action_tag() {
        let request = RegistryRequest::Register { entry: entry() };
        let bytes = wire::encode(&request).expect("encode");
        let decoded: RegistryRequest = wire::decode(&bytes).expect("decode");
        assert!(matches!(decoded, RegistryRequest::Register { .. }));
    }

    #[test]
    fn replies_tag_status() {
        let bytes = wire::encode(&AckReply::ok()).expect("encode");
        let decoded: AckReply = wire::decode(&bytes).expect("decode");
        assert!(decoded.is_ok());

        let error = LookupReply::Error {
            fault: ErrorBody::new(fault::NOT_FOUND, "no entry"),
        };
        let bytes = wire::encode(&error).expect("encode");
        let decoded: LookupReply = wire::decode(&bytes).expect("decode");
        assert!(matches!(decoded, LookupReply::Error { .. }));
    }
}
