//! Structured error events and the bus topic grammar.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{AgentName, MachineId};

const MAX_CATEGORY_LEN: usize = 32;
const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_CONTEXT_BYTES: usize = 16 * 1024;

/// Severity of an [`ErrorEvent`].
///
/// Ordered from least to most severe so subscribers can filter with a simple
/// comparison.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine lifecycle information.
    Info,
    /// Something degraded but the agent keeps serving.
    Warning,
    /// A request or subsystem failed.
    Error,
    /// The agent or a required invariant is lost.
    Critical,
}

impl Severity {
    /// Returns the lowercase topic token for this severity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bus topic helpers implementing the `err.<severity>.<machine>.<agent>`
/// grammar. Subscribers may filter by any prefix.
pub mod topic {
    use super::{AgentName, MachineId, Severity};

    /// Prefix matching every error event.
    pub const ALL: &str = "err.";

    /// Full topic for one event source.
    #[must_use]
    pub fn for_source(severity: Severity, machine: &MachineId, agent: &AgentName) -> String {
        format!("err.{}.{}.{}", severity.as_str(), machine, agent)
    }

    /// Prefix matching every event at one severity.
    #[must_use]
    pub fn severity_prefix(severity: Severity) -> String {
        format!("err.{}.", severity.as_str())
    }

    /// Prefix matching every event from one machine at one severity.
    #[must_use]
    pub fn machine_prefix(severity: Severity, machine: &MachineId) -> String {
        format!("err.{}.{}.", severity.as_str(), machine)
    }
}

/// A structured error report published to the bus.
///
/// Event ids are monotonic per publishing process; the pair
/// `(machine, agent, event_id)` orders events from one source. Construction
/// bounds the message and context sizes so a serialized event stays well
/// under the 64 KiB bus limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    agent: AgentName,
    machine: MachineId,
    severity: Severity,
    category: String,
    message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, String>,
    event_id: u64,
    epoch: DateTime<Utc>,
}

impl ErrorEvent {
    /// Starts building an event for the given source.
    #[must_use]
    pub fn builder(
        agent: AgentName,
        machine: MachineId,
        severity: Severity,
    ) -> ErrorEventBuilder {
        ErrorEventBuilder {
            agent,
            machine,
            severity,
            category: None,
            message: None,
            context: BTreeMap::new(),
            event_id: 0,
        }
    }

    /// Returns the publishing agent name.
    #[must_use]
    pub const fn agent(&self) -> &AgentName {
        &self.agent
    }

    /// Returns the publishing machine.
    #[must_use]
    pub const fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// Returns the event severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns the free-form category token, e.g. `network`.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the optional context mapping.
    #[must_use]
    pub const fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// Returns the per-publisher monotonic event id.
    #[must_use]
    pub const fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Returns the wall-clock time the event was created.
    #[must_use]
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Returns the full bus topic for this event.
    #[must_use]
    pub fn topic(&self) -> String {
        topic::for_source(self.severity, &self.machine, &self.agent)
    }
}

/// Builder for [`ErrorEvent`].
#[derive(Debug)]
pub struct ErrorEventBuilder {
    agent: AgentName,
    machine: MachineId,
    severity: Severity,
    category: Option<String>,
    message: Option<String>,
    context: BTreeMap<String, String>,
    event_id: u64,
}

impl ErrorEventBuilder {
    /// Sets the category token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the token is empty, too long, or
    /// not lowercase alphanumeric with dash or underscore.
    pub fn category(mut self, category: impl Into<String>) -> Result<Self> {
        let category = category.into();
        if category.is_empty() || category.len() > MAX_CATEGORY_LEN {
            return Err(Error::InvalidEvent {
                reason: format!("category must be 1..={MAX_CATEGORY_LEN} characters"),
            });
        }
        if !category
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
        {
            return Err(Error::InvalidEvent {
                reason: "category must be a short lowercase token".into(),
            });
        }
        self.category = Some(category);
        Ok(self)
    }

    /// Sets the message text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the message is empty or exceeds
    /// the size bound.
    pub fn message(mut self, message: impl Into<String>) -> Result<Self> {
        let message = message.into();
        if message.is_empty() {
            return Err(Error::InvalidEvent {
                reason: "message cannot be empty".into(),
            });
        }
        if message.len() > MAX_MESSAGE_BYTES {
            return Err(Error::InvalidEvent {
                reason: format!("message exceeds {MAX_MESSAGE_BYTES} bytes"),
            });
        }
        self.message = Some(message);
        Ok(self)
    }

    /// Adds one context key/value pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the accumulated context exceeds
    /// the size bound.
    pub fn context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        self.context.insert(key.into(), value.into());
        let total: usize = self
            .context
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if total > MAX_CONTEXT_BYTES {
            return Err(Error::InvalidEvent {
                reason: format!("context exceeds {MAX_CONTEXT_BYTES} bytes"),
            });
        }
        Ok(self)
    }

    /// Sets the per-publisher monotonic event id.
    #[must_use]
    pub const fn event_id(mut self, event_id: u64) -> Self {
        self.event_id = event_id;
        self
    }

    /// Finalises the event, stamping the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when category or message are missing.
    pub fn build(self) -> Result<ErrorEvent> {
        let category = self.category.ok_or_else(|| Error::InvalidEvent {
            reason: "category must be provided".into(),
        })?;
        let message = self.message.ok_or_else(|| Error::InvalidEvent {
            reason: "message must be provided".into(),
        })?;
        Ok(ErrorEvent {
            agent: self.agent,
            machine: self.machine,
            severity: self.severity,
            category,
            message,
            context: self.context,
            event_id: self.event_id,
            epoch: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> (AgentName, MachineId) {
        (
            AgentName::new("vision-capture").unwrap(),
            MachineId::new("pc2").unwrap(),
        )
    }

    #[test]
    fn builds_event_with_topic() {
        let (agent, machine) = source();
        let event = ErrorEvent::builder(agent, machine, Severity::Warning)
            .category("resource")
            .unwrap()
            .message("gpu memory low")
            .unwrap()
            .context_entry("free_mb", "312")
            .unwrap()
            .event_id(7)
            .build()
            .unwrap();

        assert_eq!(event.topic(), "err.warning.pc2.vision-capture");
        assert_eq!(event.event_id(), 7);
        assert_eq!(event.context().get("free_mb").map(String::as_str), Some("312"));
    }

    #[test]
    fn severity_prefixes_nest() {
        let (agent, machine) = source();
        let full = topic::for_source(Severity::Critical, &machine, &agent);
        assert!(full.starts_with(topic::ALL));
        assert!(full.starts_with(&topic::severity_prefix(Severity::Critical)));
        assert!(full.starts_with(&topic::machine_prefix(Severity::Critical, &machine)));
    }

    #[test]
    fn category_must_be_token() {
        let (agent, machine) = source();
        let result = ErrorEvent::builder(agent, machine, Severity::Info).category("Not A Token");
        assert!(result.is_err());
    }

    #[test]
    fn oversized_message_rejected() {
        let (agent, machine) = source();
        let result = ErrorEvent::builder(agent, machine, Severity::Error)
            .category("validation")
            .unwrap()
            .message("x".repeat(MAX_MESSAGE_BYTES + 1));
        assert!(result.is_err());
    }

    #[test]
    fn severities_order_by_weight() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
