//! Group manifest loading and validation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fabric_primitives::AgentName;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::graph;

/// Result alias for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors raised while loading or validating a manifest.
///
/// Every variant is fatal for the supervisor, which exits with the
/// invalid-configuration code before spawning anything.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The document could not be read.
    #[error("cannot read manifest {path}: {source}")]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },
    /// The document is not valid TOML.
    #[error("cannot parse manifest {path}: {source}")]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying TOML error.
        source: Box<toml::de::Error>,
    },
    /// The requested group does not exist in the document.
    #[error("manifest has no group `{group}`")]
    UnknownGroup {
        /// The missing group name.
        group: String,
    },
    /// An agent key failed name validation.
    #[error("invalid agent name: {source}")]
    InvalidName {
        /// Underlying validation error.
        #[from]
        source: fabric_primitives::Error,
    },
    /// A descriptor field holds an unusable value.
    #[error("agent `{agent}`: {reason}")]
    InvalidField {
        /// Offending agent.
        agent: String,
        /// What was wrong.
        reason: String,
    },
    /// Two descriptors share a port.
    #[error("port {port} is used by both `{first}` and `{second}`")]
    DuplicatePort {
        /// The contested port.
        port: u16,
        /// First claimant.
        first: String,
        /// Second claimant.
        second: String,
    },
    /// A dependency names an agent absent from the group.
    #[error("agent `{agent}` depends on unknown agent `{dependency}`")]
    UnknownDependency {
        /// The dependent agent.
        agent: String,
        /// The missing dependency.
        dependency: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving: {}", members.join(", "))]
    Cycle {
        /// Agents participating in the cycle.
        members: Vec<String>,
    },
}

/// What to do when a supervised process exits or is classified as crashed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart regardless of exit code.
    Always,
    /// Restart only on non-zero exit or crash classification.
    #[default]
    OnFailure,
    /// Never restart; the agent stays down.
    Never,
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_restart_window() -> Duration {
    Duration::from_secs(600)
}

fn default_max_restarts() -> u32 {
    5
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        fabric_config::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unparseable duration `{raw}`")))
    }
}

/// One agent's declarative description, as written in the manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentDescriptor {
    /// Path of the executable to spawn.
    pub executable: PathBuf,
    /// Ordered command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Port of the agent's request endpoint.
    pub request_port: u16,
    /// Port of the agent's health endpoint; defaults to `request_port + 1`.
    #[serde(default)]
    pub health_port: Option<u16>,
    /// Names this agent must see `Ready` before starting.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether a startup failure aborts the whole group.
    #[serde(default)]
    pub required: bool,
    /// Restart behaviour after exit or crash.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Budget for the agent to reach `Ready` after spawn.
    #[serde(
        default = "default_start_timeout",
        deserialize_with = "duration_str::deserialize"
    )]
    pub start_timeout: Duration,
    /// Budget for one health probe.
    #[serde(
        default = "default_health_timeout",
        deserialize_with = "duration_str::deserialize"
    )]
    pub health_timeout: Duration,
    /// Restart budget within [`AgentDescriptor::restart_window`].
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_window: u32,
    /// Window the restart budget applies to.
    #[serde(
        default = "default_restart_window",
        deserialize_with = "duration_str::deserialize"
    )]
    pub restart_window: Duration,
    /// Whether the agent declared reentrant request handling.
    #[serde(default)]
    pub reentrant: bool,
    /// Restart this agent's dependents when it leaves `Ready`.
    #[serde(default)]
    pub restart_on_dependency_loss: bool,
    /// Capability tags forwarded to the agent.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Unrecognised keys, warned about and otherwise ignored.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl AgentDescriptor {
    /// Returns the effective health port.
    #[must_use]
    pub fn health_port(&self) -> u16 {
        self.health_port
            .unwrap_or_else(|| self.request_port.saturating_add(1))
    }
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    groups: BTreeMap<String, BTreeMap<String, AgentDescriptor>>,
}

/// A validated set of descriptors for one group on one machine.
#[derive(Clone, Debug)]
pub struct GroupManifest {
    group: String,
    agents: BTreeMap<AgentName, AgentDescriptor>,
    /// Names in dependency order, computed at validation time.
    startup_order: Vec<AgentName>,
}

impl GroupManifest {
    /// Loads and validates one group from a manifest file.
    ///
    /// # Errors
    ///
    /// Any [`ManifestError`]; all of them are fatal configuration errors.
    pub fn load(path: &Path, group: &str) -> ManifestResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: ManifestDoc = toml::from_str(&text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        let agents = doc
            .groups
            .get(group)
            .ok_or_else(|| ManifestError::UnknownGroup {
                group: group.to_string(),
            })?;
        Self::from_descriptors(group, agents.clone())
    }

    /// Validates a set of descriptors directly, without a file.
    ///
    /// # Errors
    ///
    /// Any [`ManifestError`].
    pub fn from_descriptors(
        group: &str,
        raw: BTreeMap<String, AgentDescriptor>,
    ) -> ManifestResult<Self> {
        let mut agents = BTreeMap::new();
        for (name, descriptor) in raw {
            for key in descriptor.unknown.keys() {
                warn!(agent = %name, key = %key, "ignoring unknown manifest key");
            }
            let name = AgentName::new(name)?;
            agents.insert(name, descriptor);
        }

        validate_ports(&agents)?;
        validate_dependencies(&agents)?;
        let startup_order = graph::topological_order(&agents)?;

        Ok(Self {
            group: group.to_string(),
            agents,
            startup_order,
        })
    }

    /// Returns the group name.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the descriptor for one agent.
    #[must_use]
    pub fn descriptor(&self, name: &AgentName) -> Option<&AgentDescriptor> {
        self.agents.get(name)
    }

    /// Returns all descriptors keyed by name.
    #[must_use]
    pub const fn agents(&self) -> &BTreeMap<AgentName, AgentDescriptor> {
        &self.agents
    }

    /// Returns names in startup (dependency) order.
    #[must_use]
    pub fn startup_order(&self) -> &[AgentName] {
        &self.startup_order
    }

    /// Returns names in shutdown (reverse dependency) order.
    #[must_use]
    pub fn shutdown_order(&self) -> Vec<AgentName> {
        self.startup_order.iter().rev().cloned().collect()
    }

    /// Returns the names that directly depend on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &AgentName) -> Vec<AgentName> {
        self.agents
            .iter()
            .filter(|(_, descriptor)| {
                descriptor
                    .dependencies
                    .iter()
                    .any(|dep| dep == name.as_str())
            })
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }
}

fn validate_ports(agents: &BTreeMap<AgentName, AgentDescriptor>) -> ManifestResult<()> {
    let mut claims: BTreeMap<u16, String> = BTreeMap::new();
    for (name, descriptor) in agents {
        for port in [descriptor.request_port, descriptor.health_port()] {
            if let Some(first) = claims.insert(port, name.to_string()) {
                return Err(ManifestError::DuplicatePort {
                    port,
                    first,
                    second: name.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn validate_dependencies(agents: &BTreeMap<AgentName, AgentDescriptor>) -> ManifestResult<()> {
    let known: BTreeSet<&str> = agents.keys().map(AgentName::as_str).collect();
    for (name, descriptor) in agents {
        for dependency in &descriptor.dependencies {
            if !known.contains(dependency.as_str()) {
                return Err(ManifestError::UnknownDependency {
                    agent: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
            if dependency == name.as_str() {
                return Err(ManifestError::Cycle {
                    members: vec![name.to_string()],
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        [groups.core.model-manager]
        executable = "bin/model-manager"
        request_port = 5570
        required = true

        [groups.core.memory-store]
        executable = "bin/memory-store"
        request_port = 5580
        dependencies = ["model-manager"]

        [groups.core.reasoning]
        executable = "bin/reasoning"
        request_port = 5590
        health_port = 5591
        dependencies = ["memory-store"]
        restart_policy = "always"
        start_timeout = "5s"
    "#;

    fn load(text: &str, group: &str) -> ManifestResult<GroupManifest> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agents.toml");
        std::fs::write(&path, text).expect("write");
        GroupManifest::load(&path, group)
    }

    #[test]
    fn loads_and_orders_by_dependencies() {
        let manifest = load(MANIFEST, "core").expect("valid");
        let order: Vec<&str> = manifest
            .startup_order()
            .iter()
            .map(AgentName::as_str)
            .collect();
        assert_eq!(order, ["model-manager", "memory-store", "reasoning"]);

        let shutdown: Vec<String> = manifest
            .shutdown_order()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(shutdown, ["reasoning", "memory-store", "model-manager"]);
    }

    #[test]
    fn health_port_defaults_to_adjacent() {
        let manifest = load(MANIFEST, "core").expect("valid");
        let name = AgentName::new("model-manager").unwrap();
        assert_eq!(manifest.descriptor(&name).unwrap().health_port(), 5571);
        let name = AgentName::new("reasoning").unwrap();
        assert_eq!(manifest.descriptor(&name).unwrap().health_port(), 5591);
    }

    #[test]
    fn missing_group_is_an_error() {
        let err = load(MANIFEST, "audio").expect_err("unknown group");
        assert!(matches!(err, ManifestError::UnknownGroup { .. }));
    }

    #[test]
    fn duplicate_ports_rejected() {
        let text = r#"
            [groups.core.a]
            executable = "bin/a"
            request_port = 5570

            [groups.core.b]
            executable = "bin/b"
            request_port = 5571
        "#;
        // b's request port collides with a's implicit health port.
        let err = load(text, "core").expect_err("duplicate");
        assert!(matches!(err, ManifestError::DuplicatePort { port: 5571, .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let text = r#"
            [groups.core.a]
            executable = "bin/a"
            request_port = 5570
            dependencies = ["phantom"]
        "#;
        let err = load(text, "core").expect_err("unknown dep");
        assert!(matches!(err, ManifestError::UnknownDependency { .. }));
    }

    #[test]
    fn cycles_rejected() {
        let text = r#"
            [groups.core.a]
            executable = "bin/a"
            request_port = 5570
            dependencies = ["b"]

            [groups.core.b]
            executable = "bin/b"
            request_port = 5580
            dependencies = ["a"]
        "#;
        let err = load(text, "core").expect_err("cycle");
        assert!(matches!(err, ManifestError::Cycle { .. }));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let text = r#"
            [groups.core.a]
            executable = "bin/a"
            request_port = 5570
            gpu_affinity = 1
        "#;
        let manifest = load(text, "core").expect("valid despite unknown key");
        let name = AgentName::new("a").unwrap();
        assert!(manifest.descriptor(&name).unwrap().unknown.contains_key("gpu_affinity"));
    }

    #[test]
    fn dependents_are_discoverable() {
        let manifest = load(MANIFEST, "core").expect("valid");
        let name = AgentName::new("model-manager").unwrap();
        let dependents = manifest.dependents_of(&name);
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].as_str(), "memory-store");
    }
}
