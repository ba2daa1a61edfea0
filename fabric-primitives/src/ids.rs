//! Identifier types for agents, machines, and process instances.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 64;

fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: String::new(),
            reason: format!("{what} cannot be empty"),
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName {
            name: name.into(),
            reason: format!("{what} length must be <= {MAX_NAME_LEN}"),
        });
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
    {
        return Err(Error::InvalidName {
            name: name.into(),
            reason: format!("{what} must contain lowercase alphanumeric, dash, or underscore"),
        });
    }
    Ok(())
}

/// Logical name of an agent, unique within a machine's manifest.
///
/// Names appear in registry keys and bus topics, so the character set is
/// restricted to lowercase alphanumerics, dash, and underscore.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    /// Creates a new agent name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] if the name is empty, too long, or
    /// contains unsupported characters.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name, "agent name")?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AgentName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<AgentName> for String {
    fn from(value: AgentName) -> Self {
        value.0
    }
}

/// Identifier of a machine participating in the fabric.
///
/// Shares the agent-name character set; events on the bus are keyed by
/// `(machine, agent)` so the pair must be topic-safe.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Creates a new machine identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] if the identifier is empty, too long, or
    /// contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name(&id, "machine id")?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Unique identifier for a single process run of an agent.
///
/// A restarted agent keeps its [`AgentName`] but gets a fresh instance id, so
/// a registry upsert by the same name can be told apart from a conflicting
/// claim by a different live process.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generates a random instance identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an identifier from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s).map_err(Error::from)?;
        Ok(Self::from_uuid(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_topic_safe_names() {
        assert!(AgentName::new("model-manager").is_ok());
        assert!(AgentName::new("pc2_memory_store").is_ok());
        assert!(MachineId::new("mainpc").is_ok());
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(AgentName::new("").is_err());
        assert!(AgentName::new("Upper").is_err());
        assert!(AgentName::new("has space").is_err());
        assert!(AgentName::new("dot.ted").is_err());
        assert!(AgentName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn round_trip_instance_id() {
        let id = InstanceId::random();
        let parsed = id.to_string().parse::<InstanceId>().expect("parse");
        assert_eq!(id, parsed);
    }
}
