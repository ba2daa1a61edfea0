//! The context object handed to every agent callback.

use std::collections::BTreeMap;
use std::future::Future;

use fabric_config::{Config, FabricPaths};
use fabric_discovery::DiscoveryClient;
use fabric_net::EndpointPool;
use fabric_primitives::{AgentName, InstanceId, MachineId, Severity};
use tokio_util::sync::CancellationToken;

use crate::reporter::ErrorReporter;
use crate::tasks::{TaskError, TaskRegistry};

/// Everything an agent needs from its runtime, passed explicitly.
///
/// There is no process-global state: the runtime constructs one context at
/// bootstrap and hands references into each callback.
pub struct AgentContext {
    name: AgentName,
    machine: MachineId,
    instance: InstanceId,
    config: Config,
    paths: FabricPaths,
    pool: EndpointPool,
    discovery: Option<DiscoveryClient>,
    reporter: ErrorReporter,
    tasks: TaskRegistry,
    reentrant: bool,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: AgentName,
        machine: MachineId,
        instance: InstanceId,
        config: Config,
        paths: FabricPaths,
        pool: EndpointPool,
        discovery: Option<DiscoveryClient>,
        reporter: ErrorReporter,
        tasks: TaskRegistry,
        reentrant: bool,
    ) -> Self {
        Self {
            name,
            machine,
            instance,
            config,
            paths,
            pool,
            discovery,
            reporter,
            tasks,
            reentrant,
        }
    }

    /// Returns this agent's name.
    #[must_use]
    pub const fn name(&self) -> &AgentName {
        &self.name
    }

    /// Returns the machine this process runs on.
    #[must_use]
    pub const fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// Returns this process run's instance id.
    #[must_use]
    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Returns the merged configuration snapshot.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the resolved directory layout.
    #[must_use]
    pub const fn paths(&self) -> &FabricPaths {
        &self.paths
    }

    /// Returns the process endpoint pool.
    #[must_use]
    pub const fn endpoints(&self) -> &EndpointPool {
        &self.pool
    }

    /// Returns the discovery client, when a registry is configured.
    #[must_use]
    pub const fn discovery(&self) -> Option<&DiscoveryClient> {
        self.discovery.as_ref()
    }

    /// Returns whether this agent opted into reentrant request handling.
    #[must_use]
    pub const fn reentrant(&self) -> bool {
        self.reentrant
    }

    /// Returns the token observed by every loop in this process; cancelled
    /// exactly once at shutdown.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.tasks.cancellation()
    }

    /// Publishes an error event without blocking.
    ///
    /// Events pass a per-`(category, severity)` token bucket; shed events
    /// increment a local drop counter surfaced through health snapshots.
    /// Returns `true` when the event was accepted for publication.
    pub fn publish_error(
        &self,
        severity: Severity,
        category: &str,
        message: impl Into<String>,
        context: Option<BTreeMap<String, String>>,
    ) -> bool {
        self.reporter.publish(severity, category, message, context)
    }

    /// Registers a long-running background task the runtime tracks and
    /// joins at shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Closed`] once shutdown has begun.
    pub async fn register_background<F>(
        &self,
        name: impl Into<String>,
        task: F,
    ) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.register(name, task).await
    }

    pub(crate) const fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}
