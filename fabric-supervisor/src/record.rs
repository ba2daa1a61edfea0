//! Runtime bookkeeping for one supervised agent.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use fabric_primitives::AgentName;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::debug;

use crate::manifest::AgentDescriptor;

/// Observable state of a supervised agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Declared but not yet spawned.
    Pending,
    /// Spawned; waiting for the first successful health probe.
    Starting,
    /// Probes answering; the agent serves.
    Ready,
    /// One probe failed; still serving, watched closely.
    Degraded,
    /// Graceful stop in progress.
    Stopping,
    /// Exited; restart may follow per policy.
    Stopped,
    /// Out of service permanently (policy or budget exhausted).
    Failed,
}

impl AgentState {
    /// Returns `true` while probes should be issued.
    #[must_use]
    pub const fn is_probed(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// Returns `true` once no further transitions can occur.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns the lowercase display token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Sliding-window restart budget with exponential backoff.
#[derive(Debug)]
pub struct RestartTracker {
    window: Duration,
    budget: u32,
    attempts: VecDeque<Instant>,
    backoff: Duration,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl RestartTracker {
    /// Creates a tracker for the descriptor's restart budget.
    #[must_use]
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            window,
            budget,
            attempts: VecDeque::new(),
            backoff: BACKOFF_BASE,
        }
    }

    /// Records a restart attempt. Returns `false` when the windowed budget
    /// is already spent, in which case the agent must fail permanently.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.attempts.front() {
            if now.duration_since(*oldest) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() as u32 >= self.budget {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    /// Returns the delay to wait before the next restart attempt and
    /// escalates the schedule.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        delay
    }

    /// Resets the backoff schedule after a successful return to `Ready`.
    pub fn reset_backoff(&mut self) {
        self.backoff = BACKOFF_BASE;
    }

    /// Returns how many restarts happened within the current window.
    #[must_use]
    pub fn in_window(&self, now: Instant) -> u32 {
        u32::try_from(
            self.attempts
                .iter()
                .filter(|at| now.duration_since(**at) <= self.window)
                .count(),
        )
        .unwrap_or(u32::MAX)
    }
}

/// Runtime record owned exclusively by the supervisor loop.
pub struct AgentRecord {
    name: AgentName,
    descriptor: AgentDescriptor,
    /// Live child process, present between spawn and reaping.
    pub child: Option<Child>,
    state: AgentState,
    /// When the current process was spawned.
    pub started_at: Option<Instant>,
    /// When the last probe answered.
    pub last_health_at: Option<Instant>,
    /// Consecutive failed probes.
    pub probe_failures: u32,
    /// Consecutive successful probes.
    pub probe_successes: u32,
    /// Restart accounting.
    pub restarts: RestartTracker,
    /// Earliest time the next restart attempt may run.
    pub restart_due: Option<Instant>,
}

impl AgentRecord {
    /// Creates a pending record from its descriptor.
    #[must_use]
    pub fn new(name: AgentName, descriptor: AgentDescriptor) -> Self {
        let restarts = RestartTracker::new(
            descriptor.max_restarts_per_window,
            descriptor.restart_window,
        );
        Self {
            name,
            descriptor,
            child: None,
            state: AgentState::Pending,
            started_at: None,
            last_health_at: None,
            probe_failures: 0,
            probe_successes: 0,
            restarts,
            restart_due: None,
        }
    }

    /// Returns the agent name.
    #[must_use]
    pub const fn name(&self) -> &AgentName {
        &self.name
    }

    /// Returns the declarative descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> AgentState {
        self.state
    }

    /// Moves to a new state, logging the transition.
    pub fn set_state(&mut self, state: AgentState) {
        if state != self.state {
            debug!(agent = %self.name, from = self.state.as_str(), to = state.as_str(), "state transition");
            self.state = state;
        }
    }

    /// Clears probe counters, used when a fresh process starts.
    pub fn reset_probes(&mut self) {
        self.probe_failures = 0;
        self.probe_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhaustion_in_window() {
        let mut tracker = RestartTracker::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(tracker.try_admit(now));
        assert!(tracker.try_admit(now));
        assert!(!tracker.try_admit(now));
        assert_eq!(tracker.in_window(now), 2);
    }

    #[test]
    fn budget_recovers_after_window() {
        let mut tracker = RestartTracker::new(1, Duration::from_millis(10));
        let start = Instant::now();
        assert!(tracker.try_admit(start));
        assert!(!tracker.try_admit(start));
        // Past the window the old attempt no longer counts.
        let later = start + Duration::from_millis(20);
        assert!(tracker.try_admit(later));
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut tracker = RestartTracker::new(10, Duration::from_secs(600));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(1));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(2));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(4));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(8));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(16));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(30));
        assert_eq!(tracker.next_backoff(), Duration::from_secs(30));
        tracker.reset_backoff();
        assert_eq!(tracker.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn probed_states() {
        assert!(AgentState::Ready.is_probed());
        assert!(AgentState::Degraded.is_probed());
        assert!(!AgentState::Pending.is_probed());
        assert!(!AgentState::Failed.is_probed());
        assert!(AgentState::Failed.is_terminal());
    }
}
