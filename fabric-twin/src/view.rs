//! The digital twin's in-memory view of the whole fabric.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_primitives::{AgentName, ErrorEvent, HealthSnapshot, HealthStatus, MachineId, Severity};
use serde::{Deserialize, Serialize};

/// Twin behaviour knobs.
#[derive(Clone, Debug)]
pub struct TwinConfig {
    /// Error events retained per agent.
    pub recent_errors: usize,
    /// Silence beyond this marks an agent `Unknown`.
    pub grace: Duration,
    /// `Unknown` agents are retained this long before eviction.
    pub retention: Duration,
    /// Sliding window for per-severity counters and derived status.
    pub severity_window: Duration,
    /// Cadence of the twin's own `full` probes.
    pub probe_interval: Duration,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            recent_errors: 100,
            grace: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            severity_window: Duration::from_secs(300),
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Status the twin derives for an agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    /// Recent snapshot healthy, no alarming error volume.
    Ok,
    /// Snapshot degraded, or error volume elevated.
    Degraded,
    /// Snapshot unhealthy, or critical errors observed.
    Unhealthy,
    /// Nothing heard within the grace window.
    Unknown,
}

/// One agent's entry in the twin view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TwinEntry {
    /// Machine the agent runs on.
    pub machine: MachineId,
    /// Agent name.
    pub agent: AgentName,
    /// Last full health snapshot, when one has been collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<HealthSnapshot>,
    /// Most recent error events, newest last.
    pub recent_errors: Vec<ErrorEvent>,
    /// Status derived from snapshot, staleness, and error volume.
    pub derived: DerivedStatus,
    /// When the twin last heard anything from this agent.
    pub last_updated: DateTime<Utc>,
}

struct EntryState {
    snapshot: Option<HealthSnapshot>,
    recent: VecDeque<ErrorEvent>,
    derived: DerivedStatus,
    last_updated: DateTime<Utc>,
}

/// Pure derivation of an agent's status.
///
/// The inputs are exactly the last snapshot, the time since the last
/// update, and the error counts within the sliding window; the same inputs
/// always produce the same output.
#[must_use]
pub fn derive_status(
    snapshot: Option<&HealthSnapshot>,
    since_update: Duration,
    grace: Duration,
    criticals_in_window: usize,
    errors_in_window: usize,
) -> DerivedStatus {
    if since_update > grace {
        return DerivedStatus::Unknown;
    }
    if criticals_in_window > 0 {
        return DerivedStatus::Unhealthy;
    }
    let from_snapshot = match snapshot.map(HealthSnapshot::status) {
        Some(HealthStatus::Unhealthy) => DerivedStatus::Unhealthy,
        Some(HealthStatus::Degraded) => DerivedStatus::Degraded,
        Some(HealthStatus::Ok) | None => DerivedStatus::Ok,
    };
    if from_snapshot == DerivedStatus::Ok && errors_in_window >= 10 {
        return DerivedStatus::Degraded;
    }
    from_snapshot
}

/// Aggregated live view over every agent on every machine.
///
/// Owned exclusively by the twin's state task; everything else reads it
/// through messages.
pub struct TwinView {
    config: TwinConfig,
    entries: BTreeMap<(MachineId, AgentName), EntryState>,
}

/// A status change observed by the twin, broadcast to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthTransition {
    /// Machine of the agent.
    pub machine: MachineId,
    /// Agent that changed.
    pub agent: AgentName,
    /// Status before the change.
    pub from: DerivedStatus,
    /// Status after the change.
    pub to: DerivedStatus,
    /// When the twin observed it.
    pub at: DateTime<Utc>,
}

impl TwinView {
    /// Creates an empty view.
    #[must_use]
    pub fn new(config: TwinConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
        }
    }

    /// Folds one bus event into the view, returning a transition when the
    /// derived status changed.
    pub fn record_event(&mut self, event: ErrorEvent) -> Option<HealthTransition> {
        let key = (event.machine().clone(), event.agent().clone());
        let recent_cap = self.config.recent_errors;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| EntryState {
            snapshot: None,
            recent: VecDeque::new(),
            derived: DerivedStatus::Unknown,
            last_updated: Utc::now(),
        });
        entry.recent.push_back(event);
        while entry.recent.len() > recent_cap {
            entry.recent.pop_front();
        }
        entry.last_updated = Utc::now();
        self.rederive(&key)
    }

    /// Folds one probe result into the view.
    pub fn record_snapshot(
        &mut self,
        machine: MachineId,
        agent: AgentName,
        snapshot: HealthSnapshot,
    ) -> Option<HealthTransition> {
        let key = (machine, agent);
        let entry = self.entries.entry(key.clone()).or_insert_with(|| EntryState {
            snapshot: None,
            recent: VecDeque::new(),
            derived: DerivedStatus::Unknown,
            last_updated: Utc::now(),
        });
        entry.snapshot = Some(snapshot);
        entry.last_updated = Utc::now();
        self.rederive(&key)
    }

    /// Re-evaluates staleness for every entry and evicts those past
    /// retention. Returns the transitions that occurred.
    pub fn sweep(&mut self) -> Vec<HealthTransition> {
        let now = Utc::now();
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
        self.entries
            .retain(|_, entry| now.signed_duration_since(entry.last_updated) <= retention);

        let keys: Vec<(MachineId, AgentName)> = self.entries.keys().cloned().collect();
        keys.iter().filter_map(|key| self.rederive(key)).collect()
    }

    /// Returns one agent's entry.
    #[must_use]
    pub fn status(&self, machine: &MachineId, agent: &AgentName) -> Option<TwinEntry> {
        let key = (machine.clone(), agent.clone());
        self.entries.get(&key).map(|entry| to_public(&key, entry))
    }

    /// Returns every entry, ordered by `(machine, agent)`.
    #[must_use]
    pub fn status_all(&self) -> Vec<TwinEntry> {
        self.entries
            .iter()
            .map(|(key, entry)| to_public(key, entry))
            .collect()
    }

    /// Returns recent errors, optionally filtered.
    #[must_use]
    pub fn recent_errors(
        &self,
        agent: Option<&AgentName>,
        since: Option<DateTime<Utc>>,
        min_severity: Option<Severity>,
    ) -> Vec<ErrorEvent> {
        let mut events: Vec<ErrorEvent> = self
            .entries
            .iter()
            .filter(|((_, name), _)| agent.is_none_or(|wanted| wanted == name))
            .flat_map(|(_, entry)| entry.recent.iter().cloned())
            .filter(|event| since.is_none_or(|at| event.epoch() >= at))
            .filter(|event| min_severity.is_none_or(|floor| event.severity() >= floor))
            .collect();
        events.sort_by_key(ErrorEvent::epoch);
        events
    }

    /// Returns per-severity counts within the sliding window.
    #[must_use]
    pub fn severity_counters(&self) -> BTreeMap<Severity, usize> {
        let cutoff = self.window_cutoff();
        let mut counters = BTreeMap::new();
        for entry in self.entries.values() {
            for event in &entry.recent {
                if event.epoch() >= cutoff {
                    *counters.entry(event.severity()).or_insert(0) += 1;
                }
            }
        }
        counters
    }

    fn window_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.config.severity_window)
                .unwrap_or(chrono::Duration::MAX)
    }

    fn rederive(&mut self, key: &(MachineId, AgentName)) -> Option<HealthTransition> {
        let cutoff = self.window_cutoff();
        let grace = self.config.grace;
        let entry = self.entries.get_mut(key)?;
        let since_update = Utc::now()
            .signed_duration_since(entry.last_updated)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let criticals = entry
            .recent
            .iter()
            .filter(|e| e.epoch() >= cutoff && e.severity() == Severity::Critical)
            .count();
        let errors = entry
            .recent
            .iter()
            .filter(|e| e.epoch() >= cutoff && e.severity() >= Severity::Error)
            .count();
        let derived = derive_status(
            entry.snapshot.as_ref(),
            since_update,
            grace,
            criticals,
            errors,
        );
        if derived == entry.derived {
            return None;
        }
        let transition = HealthTransition {
            machine: key.0.clone(),
            agent: key.1.clone(),
            from: entry.derived,
            to: derived,
            at: Utc::now(),
        };
        entry.derived = derived;
        Some(transition)
    }
}

fn to_public(key: &(MachineId, AgentName), entry: &EntryState) -> TwinEntry {
    TwinEntry {
        machine: key.0.clone(),
        agent: key.1.clone(),
        snapshot: entry.snapshot.clone(),
        recent_errors: entry.recent.iter().cloned().collect(),
        derived: entry.derived,
        last_updated: entry.last_updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(agent: &str) -> (AgentName, MachineId) {
        (
            AgentName::new(agent).unwrap(),
            MachineId::new("mainpc").unwrap(),
        )
    }

    fn event(agent: &str, severity: Severity, id: u64) -> ErrorEvent {
        let (agent, machine) = source(agent);
        ErrorEvent::builder(agent, machine, severity)
            .category("network")
            .unwrap()
            .message(format!("event {id}"))
            .unwrap()
            .event_id(id)
            .build()
            .unwrap()
    }

    fn ok_snapshot() -> HealthSnapshot {
        HealthSnapshot::from_checks(10, BTreeMap::new(), BTreeMap::new())
    }

    #[test]
    fn derivation_is_pure_and_ordered() {
        let grace = Duration::from_secs(30);
        // Fresh and quiet: ok.
        assert_eq!(
            derive_status(Some(&ok_snapshot()), Duration::from_secs(1), grace, 0, 0),
            DerivedStatus::Ok
        );
        // Stale beats everything.
        assert_eq!(
            derive_status(Some(&ok_snapshot()), Duration::from_secs(31), grace, 0, 0),
            DerivedStatus::Unknown
        );
        // Criticals beat a clean snapshot.
        assert_eq!(
            derive_status(Some(&ok_snapshot()), Duration::from_secs(1), grace, 1, 0),
            DerivedStatus::Unhealthy
        );
        // Elevated error volume degrades an otherwise clean agent.
        assert_eq!(
            derive_status(Some(&ok_snapshot()), Duration::from_secs(1), grace, 0, 10),
            DerivedStatus::Degraded
        );
        // No snapshot yet but the agent is talking: ok.
        assert_eq!(
            derive_status(None, Duration::from_secs(1), grace, 0, 0),
            DerivedStatus::Ok
        );
    }

    #[test]
    fn snapshot_recovery_emits_transition() {
        let mut view = TwinView::new(TwinConfig::default());
        let (agent, machine) = source("asr");

        let transition = view.record_snapshot(machine.clone(), agent.clone(), ok_snapshot());
        // Unknown -> Ok on first contact.
        let transition = transition.expect("first transition");
        assert_eq!(transition.from, DerivedStatus::Unknown);
        assert_eq!(transition.to, DerivedStatus::Ok);

        // A critical event flips the derived status.
        let transition = view.record_event(event("asr", Severity::Critical, 1));
        let transition = transition.expect("critical transition");
        assert_eq!(transition.to, DerivedStatus::Unhealthy);

        let entry = view.status(&machine, &agent).expect("entry");
        assert_eq!(entry.derived, DerivedStatus::Unhealthy);
        assert_eq!(entry.recent_errors.len(), 1);
    }

    #[test]
    fn recent_errors_cap_and_filters() {
        let config = TwinConfig {
            recent_errors: 5,
            ..TwinConfig::default()
        };
        let mut view = TwinView::new(config);
        for id in 0..8 {
            view.record_event(event("asr", Severity::Warning, id));
        }
        view.record_event(event("tts", Severity::Error, 100));

        let (agent, _machine) = source("asr");
        let asr = view.recent_errors(Some(&agent), None, None);
        assert_eq!(asr.len(), 5, "bounded per agent");
        assert_eq!(asr.first().map(ErrorEvent::event_id), Some(3));

        let severe = view.recent_errors(None, None, Some(Severity::Error));
        assert_eq!(severe.len(), 1);
        assert_eq!(severe[0].agent().as_str(), "tts");

        let counters = view.severity_counters();
        assert_eq!(counters.get(&Severity::Warning), Some(&5));
        assert_eq!(counters.get(&Severity::Error), Some(&1));
    }

    #[test]
    fn machines_are_distinct_keys() {
        let mut view = TwinView::new(TwinConfig::default());
        let agent = AgentName::new("memory-store").unwrap();
        view.record_snapshot(
            MachineId::new("mainpc").unwrap(),
            agent.clone(),
            ok_snapshot(),
        );
        view.record_snapshot(MachineId::new("pc2").unwrap(), agent, ok_snapshot());
        assert_eq!(view.status_all().len(), 2);
    }
}
