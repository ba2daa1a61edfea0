//! Lifecycle state machine for fabric agent processes.

use fabric_primitives::AgentName;
use thiserror::Error;
use tracing::debug;

/// Discrete states a running agent process moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Runtime constructed but not yet bootstrapped.
    Created,
    /// Configuration loaded, endpoints being acquired, `on_start` running.
    Starting,
    /// Request and health loops are live.
    Serving,
    /// Shutdown observed; draining handlers and background tasks.
    Draining,
    /// Fully stopped; endpoints released.
    Stopped,
}

impl RuntimeState {
    /// Returns `true` while the agent is answering requests.
    #[must_use]
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Serving)
    }

    /// Returns `true` once the process reached its terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Begin bootstrapping configuration and endpoints.
    Bootstrap,
    /// Startup finished; start serving.
    Serve,
    /// Shutdown signal observed; begin draining.
    Drain,
    /// Draining finished; release everything.
    Stop,
    /// Startup failed or an invariant broke; go straight to stopped.
    Abort,
}

/// Lifecycle state manager for one agent process.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    agent: AgentName,
    state: RuntimeState,
}

impl Lifecycle {
    /// Constructs a lifecycle controller for the given agent.
    #[must_use]
    pub const fn new(agent: AgentName) -> Self {
        Self {
            agent,
            state: RuntimeState::Created,
        }
    }

    /// Returns the owning agent name.
    #[must_use]
    pub const fn agent(&self) -> &AgentName {
        &self.agent
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> RuntimeState {
        self.state
    }

    /// Applies a lifecycle event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the supplied event
    /// is not allowed from the current state.
    pub fn transition(&mut self, event: RuntimeEvent) -> LifecycleResult<RuntimeState> {
        let next = match (self.state, event) {
            (RuntimeState::Created, RuntimeEvent::Bootstrap) => Some(RuntimeState::Starting),
            (RuntimeState::Starting, RuntimeEvent::Serve) => Some(RuntimeState::Serving),
            (RuntimeState::Starting | RuntimeState::Serving, RuntimeEvent::Drain) => {
                Some(RuntimeState::Draining)
            }
            (RuntimeState::Draining, RuntimeEvent::Stop) | (_, RuntimeEvent::Abort) => {
                Some(RuntimeState::Stopped)
            }
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                agent: self.agent.clone(),
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(
                agent = %self.agent,
                ?self.state,
                ?next_state,
                ?event,
                "runtime lifecycle transition"
            );
            self.state = next_state;
        }

        Ok(self.state)
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from:?} via {event:?} for agent {agent}")]
    InvalidTransition {
        /// Agent whose transition failed.
        agent: AgentName,
        /// State prior to the attempted transition.
        from: RuntimeState,
        /// Event that triggered the failure.
        event: RuntimeEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentName {
        AgentName::new("lifecycle-test").expect("name")
    }

    #[test]
    fn bootstrap_to_serving_flow() {
        let mut lifecycle = Lifecycle::new(agent());
        assert_eq!(lifecycle.state(), RuntimeState::Created);
        lifecycle.transition(RuntimeEvent::Bootstrap).unwrap();
        assert_eq!(lifecycle.state(), RuntimeState::Starting);
        lifecycle.transition(RuntimeEvent::Serve).unwrap();
        assert!(lifecycle.state().is_serving());
    }

    #[test]
    fn drain_then_stop() {
        let mut lifecycle = Lifecycle::new(agent());
        lifecycle.transition(RuntimeEvent::Bootstrap).unwrap();
        lifecycle.transition(RuntimeEvent::Serve).unwrap();
        lifecycle.transition(RuntimeEvent::Drain).unwrap();
        assert_eq!(lifecycle.state(), RuntimeState::Draining);
        lifecycle.transition(RuntimeEvent::Stop).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn abort_is_global() {
        let mut lifecycle = Lifecycle::new(agent());
        lifecycle.transition(RuntimeEvent::Abort).unwrap();
        assert!(lifecycle.state().is_terminal());
        // Further aborts keep the state terminal.
        lifecycle.transition(RuntimeEvent::Abort).unwrap();
        assert_eq!(lifecycle.state(), RuntimeState::Stopped);
    }

    #[test]
    fn invalid_transition_errors() {
        let mut lifecycle = Lifecycle::new(agent());
        let err = lifecycle
            .transition(RuntimeEvent::Serve)
            .expect_err("serve should fail from created");
        matches!(err, LifecycleError::InvalidTransition { .. });
    }

    #[test]
    fn startup_failure_drains_from_starting() {
        let mut lifecycle = Lifecycle::new(agent());
        lifecycle.transition(RuntimeEvent::Bootstrap).unwrap();
        lifecycle.transition(RuntimeEvent::Drain).unwrap();
        lifecycle.transition(RuntimeEvent::Stop).unwrap();
        assert!(lifecycle.state().is_terminal());
    }
}
