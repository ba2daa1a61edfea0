//! Registry entry type.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fabric_primitives::{AgentName, EndpointAddress, InstanceId};
use serde::{Deserialize, Serialize};

/// One agent's registration in the directory.
///
/// Entries are upserted whole: a later `register` for the same name fully
/// replaces the earlier one. The instance id identifies the process run that
/// owns the entry, so conflict detection can tell a restart apart from a
/// second process claiming the same endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    name: AgentName,
    instance: InstanceId,
    request_endpoint: EndpointAddress,
    health_endpoint: EndpointAddress,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    registered_at: DateTime<Utc>,
}

impl ServiceEntry {
    /// Creates an entry for the given agent and endpoints, stamping the
    /// current wall-clock time.
    #[must_use]
    pub fn new(
        name: AgentName,
        instance: InstanceId,
        request_endpoint: EndpointAddress,
        health_endpoint: EndpointAddress,
    ) -> Self {
        Self {
            name,
            instance,
            request_endpoint,
            health_endpoint,
            capabilities: BTreeSet::new(),
            metadata: BTreeMap::new(),
            registered_at: Utc::now(),
        }
    }

    /// Adds a capability tag.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the agent name, the entry's unique key.
    #[must_use]
    pub const fn name(&self) -> &AgentName {
        &self.name
    }

    /// Returns the owning process instance.
    #[must_use]
    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Returns the request endpoint peers send work to.
    #[must_use]
    pub const fn request_endpoint(&self) -> &EndpointAddress {
        &self.request_endpoint
    }

    /// Returns the health endpoint probes target.
    #[must_use]
    pub const fn health_endpoint(&self) -> &EndpointAddress {
        &self.health_endpoint
    }

    /// Returns the advertised capability tags.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Returns the opaque metadata mapping.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Returns when this entry was last registered.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Returns `true` when the entry advertises the capability tag.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Refreshes the registration stamp, used on upsert.
    pub fn touch(&mut self) {
        self.registered_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_style_construction() {
        let entry = ServiceEntry::new(
            AgentName::new("model-manager").unwrap(),
            InstanceId::random(),
            "tcp://10.0.0.1:5570".parse().unwrap(),
            "tcp://10.0.0.1:5571".parse().unwrap(),
        )
        .with_capability("inference")
        .with_metadata("gpu", "rtx-4090");

        assert!(entry.has_capability("inference"));
        assert!(!entry.has_capability("speech"));
        assert_eq!(entry.metadata().get("gpu").map(String::as_str), Some("rtx-4090"));
        assert_eq!(entry.health_endpoint().port(), 5571);
    }
}
