//! The supervision loop: startup, steady state, shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fabric_net::wire::{self, ErrorBody, fault};
use fabric_net::{EndpointError, EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress, Severity};
use fabric_runtime::{EXIT_OK, EXIT_REQUIRED, ErrorReporter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::manifest::{GroupManifest, RestartPolicy};
use crate::probe::ProbeClient;
use crate::process::{SpawnContext, spawn_agent};
use crate::protocol::{AgentStatus, CommandReply, StatusReply, SupervisorRequest};
use crate::record::{AgentRecord, AgentState};

/// Global supervision policies, applying to every agent in the group.
#[derive(Clone, Debug)]
pub struct SupervisorPolicies {
    /// Cadence of steady-state `ping` probes.
    pub health_probe_interval: Duration,
    /// Consecutive probe failures treated as a crash.
    pub crash_threshold: u32,
    /// Grace given to agents between control stop and force kill.
    pub shutdown_grace: Duration,
    /// Address of the operator query endpoint, when enabled.
    pub query_bind: Option<EndpointAddress>,
}

impl Default for SupervisorPolicies {
    fn default() -> Self {
        Self {
            health_probe_interval: Duration::from_secs(1),
            crash_threshold: 3,
            shutdown_grace: Duration::from_secs(10),
            query_bind: None,
        }
    }
}

enum Command {
    Status(oneshot::Sender<Vec<AgentStatus>>),
    Stop(AgentName, oneshot::Sender<Result<(), String>>),
    Start(AgentName, oneshot::Sender<Result<(), String>>),
}

/// Outcome of one startup pass.
enum StartupOutcome {
    Complete,
    RequiredFailed(AgentName),
    Interrupted,
}

/// Dependency-aware supervisor for one group manifest on one machine.
///
/// The supervisor exclusively owns every [`AgentRecord`]; operators read
/// state by sending a message to the query endpoint, never by sharing
/// memory.
pub struct Supervisor {
    manifest: GroupManifest,
    policies: SupervisorPolicies,
    spawn_ctx: SpawnContext,
    records: BTreeMap<AgentName, AgentRecord>,
    prober: Arc<ProbeClient>,
    reporter: ErrorReporter,
    held: BTreeMap<AgentName, bool>,
}

impl Supervisor {
    /// Creates a supervisor over a validated manifest.
    #[must_use]
    pub fn new(
        manifest: GroupManifest,
        policies: SupervisorPolicies,
        spawn_ctx: SpawnContext,
        pool: EndpointPool,
        reporter: ErrorReporter,
    ) -> Self {
        let records = manifest
            .agents()
            .iter()
            .map(|(name, descriptor)| {
                (
                    name.clone(),
                    AgentRecord::new(name.clone(), descriptor.clone()),
                )
            })
            .collect();
        Self {
            manifest,
            policies,
            spawn_ctx,
            records,
            prober: Arc::new(ProbeClient::new(pool)),
            reporter,
            held: BTreeMap::new(),
        }
    }

    /// Brings the group up, supervises it, and tears it down on shutdown.
    /// Returns the documented process exit code.
    pub async fn run(mut self, shutdown: CancellationToken) -> i32 {
        let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);
        let query_pool = EndpointPool::new();
        let query_worker = self.policies.query_bind.clone().map(|bind| {
            let pool = query_pool.clone();
            let group = self.manifest.group().to_string();
            let token = shutdown.clone();
            tokio::spawn(async move { serve_queries(pool, bind, command_tx, group, token).await })
        });

        match self.startup(&shutdown).await {
            StartupOutcome::Complete => {}
            StartupOutcome::Interrupted => {
                self.graceful_shutdown().await;
                return EXIT_OK;
            }
            StartupOutcome::RequiredFailed(name) => {
                self.emit(
                    Severity::Critical,
                    "supervision",
                    format!("required agent `{name}` failed to reach ready; aborting group"),
                );
                self.graceful_shutdown().await;
                return EXIT_REQUIRED;
            }
        }

        let mut ticker = tokio::time::interval(self.policies.health_probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.supervise_tick().await,
                Some(command) = command_rx.recv() => self.handle_command(command).await,
            }
        }

        self.graceful_shutdown().await;
        if let Some(worker) = query_worker {
            worker.abort();
        }
        query_pool.close_all().await;
        EXIT_OK
    }

    /// Spawns agents in dependency order, waiting for each to reach ready.
    async fn startup(&mut self, shutdown: &CancellationToken) -> StartupOutcome {
        for name in self.manifest.startup_order().to_vec() {
            if shutdown.is_cancelled() {
                return StartupOutcome::Interrupted;
            }
            if let Some(failed_dep) = self.unready_dependency(&name) {
                let required = self.record(&name).descriptor().required;
                if required {
                    return StartupOutcome::RequiredFailed(name);
                }
                self.emit(
                    Severity::Warning,
                    "supervision",
                    format!("skipping `{name}`: dependency `{failed_dep}` is not ready"),
                );
                self.record_mut(&name).set_state(AgentState::Failed);
                continue;
            }

            if !self.start_agent(&name, shutdown).await {
                if shutdown.is_cancelled() {
                    return StartupOutcome::Interrupted;
                }
                let required = self.record(&name).descriptor().required;
                if required {
                    return StartupOutcome::RequiredFailed(name);
                }
                self.record_mut(&name).set_state(AgentState::Failed);
            }
        }
        StartupOutcome::Complete
    }

    /// Spawns one agent's process and marks it `Starting`. Readiness is
    /// observed separately: synchronously during startup, via the probe
    /// loop for restarts.
    async fn spawn_only(&mut self, name: &AgentName) -> bool {
        let descriptor = self.record(name).descriptor().clone();
        info!(agent = %name, executable = %descriptor.executable.display(), "spawning");
        let child = match spawn_agent(name, &descriptor, &self.spawn_ctx).await {
            Ok(child) => child,
            Err(err) => {
                self.emit(
                    Severity::Error,
                    "supervision",
                    format!("spawn of `{name}` failed: {err}"),
                );
                return false;
            }
        };

        {
            let record = self.record_mut(name);
            record.child = Some(child);
            record.started_at = Some(Instant::now());
            record.reset_probes();
            record.restart_due = None;
            record.set_state(AgentState::Starting);
        }
        self.emit(
            Severity::Info,
            "lifecycle",
            format!("`{name}` starting on port {}", descriptor.request_port),
        );
        true
    }

    /// Spawns one agent and polls its health endpoint until ready or until
    /// the start timeout. Returns `true` on ready.
    async fn start_agent(&mut self, name: &AgentName, shutdown: &CancellationToken) -> bool {
        if !self.spawn_only(name).await {
            return false;
        }
        let descriptor = self.record(name).descriptor().clone();

        let health = match EndpointAddress::new(
            self.spawn_ctx.bind_host.clone(),
            descriptor.health_port(),
        ) {
            Ok(address) => address,
            Err(err) => {
                error!(agent = %name, error = %err, "invalid health address");
                return false;
            }
        };

        let deadline = Instant::now() + descriptor.start_timeout;
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            if Instant::now() >= deadline {
                warn!(agent = %name, "start timeout; killing");
                self.kill(name).await;
                self.emit(
                    Severity::Error,
                    "supervision",
                    format!(
                        "`{name}` did not become ready within {:?}",
                        descriptor.start_timeout
                    ),
                );
                return false;
            }
            // A child that already exited will never answer.
            if let Some(status) = self.try_reap(name) {
                self.emit(
                    Severity::Error,
                    "supervision",
                    format!("`{name}` exited during startup with {status}"),
                );
                return false;
            }
            if self
                .prober
                .ping(&health, descriptor.health_timeout)
                .await
                .is_ok()
            {
                let record = self.record_mut(name);
                record.last_health_at = Some(Instant::now());
                record.restarts.reset_backoff();
                record.set_state(AgentState::Ready);
                self.emit(Severity::Info, "lifecycle", format!("`{name}` ready"));
                return true;
            }
            tokio::time::sleep(self.policies.health_probe_interval).await;
        }
    }

    /// One steady-state pass: reap exits, probe, classify, restart.
    async fn supervise_tick(&mut self) {
        // Reap processes that exited on their own.
        let names: Vec<AgentName> = self.records.keys().cloned().collect();
        for name in &names {
            if !matches!(
                self.record(name).state(),
                AgentState::Starting | AgentState::Ready | AgentState::Degraded
            ) {
                continue;
            }
            if let Some(status) = self.try_reap(name) {
                let crashed = !status.success();
                self.emit(
                    if crashed { Severity::Error } else { Severity::Info },
                    "supervision",
                    format!("`{name}` exited with {status}"),
                );
                self.agent_down(name, crashed).await;
            }
        }

        // Probe everything that should be answering, concurrently. Agents
        // in `Starting` (restarts) are probed too, so readiness promotion
        // never blocks this loop.
        let mut probes = JoinSet::new();
        for name in &names {
            let record = self.record(name);
            if !record.state().is_probed() && record.state() != AgentState::Starting {
                continue;
            }
            let Ok(address) = EndpointAddress::new(
                self.spawn_ctx.bind_host.clone(),
                record.descriptor().health_port(),
            ) else {
                continue;
            };
            let prober = Arc::clone(&self.prober);
            let budget = record.descriptor().health_timeout;
            let name = name.clone();
            probes.spawn(async move {
                let outcome = prober.ping(&address, budget).await;
                (name, outcome.is_ok())
            });
        }
        while let Some(joined) = probes.join_next().await {
            let Ok((name, healthy)) = joined else {
                continue;
            };
            self.apply_probe(&name, healthy).await;
        }

        // Run restarts that have come due and whose dependencies are ready.
        for name in &names {
            let due = self
                .record(name)
                .restart_due
                .is_some_and(|at| Instant::now() >= at);
            if !due || self.held.get(name).copied().unwrap_or(false) {
                continue;
            }
            if let Some(dep) = self.unready_dependency(name) {
                tracing::debug!(agent = %name, dependency = %dep, "restart deferred");
                continue;
            }
            if !self.spawn_only(name).await {
                // The attempt failed; schedule the next one under the budget.
                self.schedule_restart(name);
            }
        }
    }

    async fn apply_probe(&mut self, name: &AgentName, healthy: bool) {
        let state = self.record(name).state();
        if state == AgentState::Starting {
            self.apply_starting_probe(name, healthy).await;
            return;
        }
        if !state.is_probed() {
            return;
        }
        if healthy {
            let record = self.record_mut(name);
            record.probe_failures = 0;
            record.probe_successes += 1;
            record.last_health_at = Some(Instant::now());
            if state == AgentState::Degraded && record.probe_successes >= 2 {
                record.set_state(AgentState::Ready);
                record.restarts.reset_backoff();
                self.emit(Severity::Info, "health", format!("`{name}` recovered"));
            }
            return;
        }

        let threshold = self.policies.crash_threshold;
        let failures = {
            let record = self.record_mut(name);
            record.probe_successes = 0;
            record.probe_failures += 1;
            record.probe_failures
        };
        if failures >= threshold {
            self.emit(
                Severity::Error,
                "health",
                format!("`{name}` missed {failures} consecutive probes; treating as crash"),
            );
            self.kill(name).await;
            self.agent_down(name, true).await;
        } else if state == AgentState::Ready {
            self.record_mut(name).set_state(AgentState::Degraded);
            self.emit(
                Severity::Warning,
                "health",
                format!("`{name}` degraded: probe failure {failures}/{threshold}"),
            );
        }
    }

    /// Promotes a restarted `Starting` agent on its first successful probe,
    /// or fails it once the start timeout lapses.
    async fn apply_starting_probe(&mut self, name: &AgentName, healthy: bool) {
        if healthy {
            let record = self.record_mut(name);
            record.last_health_at = Some(Instant::now());
            record.reset_probes();
            record.restarts.reset_backoff();
            record.set_state(AgentState::Ready);
            self.emit(Severity::Info, "lifecycle", format!("`{name}` ready"));
            return;
        }
        let timed_out = {
            let record = self.record(name);
            record
                .started_at
                .is_some_and(|at| at.elapsed() > record.descriptor().start_timeout)
        };
        if timed_out {
            self.emit(
                Severity::Error,
                "supervision",
                format!("`{name}` did not become ready after restart"),
            );
            self.kill(name).await;
            self.agent_down(name, true).await;
        }
    }

    /// Applies restart policy after an agent stopped answering or exited.
    async fn agent_down(&mut self, name: &AgentName, crashed: bool) {
        {
            let record = self.record_mut(name);
            record.child = None;
            record.set_state(AgentState::Stopped);
            record.reset_probes();
        }

        // Dependents that opted into cascade restarts go down with it; the
        // default is to leave them up and only record the event.
        let dependents = self.manifest.dependents_of(name);
        for dependent in dependents {
            let record = self.record(&dependent);
            if !matches!(record.state(), AgentState::Ready | AgentState::Degraded) {
                continue;
            }
            if record.descriptor().restart_on_dependency_loss {
                self.emit(
                    Severity::Warning,
                    "supervision",
                    format!("restarting `{dependent}`: dependency `{name}` went down"),
                );
                self.kill(&dependent).await;
                Box::pin(self.agent_down(&dependent, true)).await;
            } else {
                self.emit(
                    Severity::Info,
                    "supervision",
                    format!("dependency `{name}` of `{dependent}` went down; leaving dependent up"),
                );
            }
        }

        let policy = self.record(name).descriptor().restart_policy;
        let restart = match policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => crashed,
            RestartPolicy::Always => true,
        };
        if !restart {
            if policy == RestartPolicy::Never {
                self.record_mut(name).set_state(AgentState::Failed);
            }
            return;
        }
        if self.held.get(name).copied().unwrap_or(false) {
            return;
        }
        self.schedule_restart(name);
    }

    /// Admits a restart against the windowed budget and schedules it with
    /// backoff; exhausting the budget fails the agent permanently.
    fn schedule_restart(&mut self, name: &AgentName) {
        let now = Instant::now();
        let record = self.record_mut(name);
        if !record.restarts.try_admit(now) {
            record.set_state(AgentState::Failed);
            let budget = record.descriptor().max_restarts_per_window;
            let window = record.descriptor().restart_window;
            self.emit(
                Severity::Critical,
                "supervision",
                format!("`{name}` exceeded {budget} restarts in {window:?}; failed permanently"),
            );
            return;
        }
        let delay = record.restarts.next_backoff();
        record.restart_due = Some(now + delay);
        self.emit(
            Severity::Warning,
            "supervision",
            format!("restart of `{name}` scheduled in {delay:?}"),
        );
    }

    /// Stops every agent in reverse dependency order: control stop first,
    /// force kill after the grace period.
    async fn graceful_shutdown(&mut self) {
        let mut graceful = 0u32;
        let mut forced = 0u32;
        for name in self.manifest.shutdown_order() {
            let record = self.record(&name);
            if record.child.is_none() {
                continue;
            }
            let descriptor = record.descriptor().clone();
            self.record_mut(&name).set_state(AgentState::Stopping);

            let stopped = if let Ok(health) = EndpointAddress::new(
                self.spawn_ctx.bind_host.clone(),
                descriptor.health_port(),
            ) {
                self.prober
                    .stop(&health, descriptor.health_timeout)
                    .await
                    .is_ok()
            } else {
                false
            };
            if !stopped {
                // Fall back to OS termination via kill below.
                warn!(agent = %name, "control stop not acknowledged");
            }

            let exited = self.wait_exit(&name, self.policies.shutdown_grace).await;
            if exited {
                graceful += 1;
            } else {
                forced += 1;
                self.kill(&name).await;
                self.emit(
                    Severity::Warning,
                    "supervision",
                    format!(
                        "`{name}` did not exit within {:?}; force terminated",
                        self.policies.shutdown_grace
                    ),
                );
            }
            self.record_mut(&name).set_state(AgentState::Stopped);
            self.emit(Severity::Info, "lifecycle", format!("`{name}` stopped"));
        }
        self.emit(
            Severity::Info,
            "supervision",
            format!(
                "group `{}` shut down: {graceful} graceful, {forced} forced",
                self.manifest.group()
            ),
        );
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status_snapshot());
            }
            Command::Stop(name, reply) => {
                if !self.records.contains_key(&name) {
                    let _ = reply.send(Err(format!("unknown agent `{name}`")));
                    return;
                }
                self.held.insert(name.clone(), true);
                if self.record(&name).child.is_some() {
                    let descriptor = self.record(&name).descriptor().clone();
                    if let Ok(health) = EndpointAddress::new(
                        self.spawn_ctx.bind_host.clone(),
                        descriptor.health_port(),
                    ) {
                        let _ = self.prober.stop(&health, descriptor.health_timeout).await;
                    }
                    if !self.wait_exit(&name, self.policies.shutdown_grace).await {
                        self.kill(&name).await;
                    }
                }
                self.record_mut(&name).set_state(AgentState::Stopped);
                self.record_mut(&name).restart_due = None;
                self.emit(
                    Severity::Info,
                    "lifecycle",
                    format!("`{name}` stopped by operator"),
                );
                let _ = reply.send(Ok(()));
            }
            Command::Start(name, reply) => {
                if !self.records.contains_key(&name) {
                    let _ = reply.send(Err(format!("unknown agent `{name}`")));
                    return;
                }
                self.held.insert(name.clone(), false);
                if matches!(
                    self.record(&name).state(),
                    AgentState::Stopped | AgentState::Failed | AgentState::Pending
                ) {
                    self.record_mut(&name).restart_due = Some(Instant::now());
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(format!("agent `{name}` is already running")));
                }
            }
        }
    }

    fn status_snapshot(&self) -> Vec<AgentStatus> {
        let now = Instant::now();
        self.records
            .values()
            .map(|record| AgentStatus {
                name: record.name().to_string(),
                state: record.state(),
                pid: record.child.as_ref().and_then(tokio::process::Child::id),
                uptime_seconds: record
                    .started_at
                    .map(|at| now.duration_since(at).as_secs()),
                restarts_in_window: record.restarts.in_window(now),
                probe_failures: record.probe_failures,
            })
            .collect()
    }

    /// Returns the first dependency of `name` that is not ready.
    fn unready_dependency(&self, name: &AgentName) -> Option<String> {
        let descriptor = self.record(name).descriptor();
        descriptor
            .dependencies
            .iter()
            .find(|dep| {
                AgentName::new(dep.as_str())
                    .ok()
                    .and_then(|dep| self.records.get(&dep))
                    .is_none_or(|record| record.state() != AgentState::Ready)
            })
            .cloned()
    }

    fn try_reap(&mut self, name: &AgentName) -> Option<std::process::ExitStatus> {
        let record = self.record_mut(name);
        let child = record.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                record.child = None;
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(agent = %name, error = %err, "wait failed");
                None
            }
        }
    }

    async fn wait_exit(&mut self, name: &AgentName, budget: Duration) -> bool {
        let Some(child) = self.record_mut(name).child.as_mut() else {
            return true;
        };
        match tokio::time::timeout(budget, child.wait()).await {
            Ok(Ok(_)) => {
                self.record_mut(name).child = None;
                true
            }
            Ok(Err(err)) => {
                warn!(agent = %name, error = %err, "wait failed");
                self.record_mut(name).child = None;
                true
            }
            Err(_) => false,
        }
    }

    async fn kill(&mut self, name: &AgentName) {
        if let Some(child) = self.record_mut(name).child.as_mut() {
            if let Err(err) = child.kill().await {
                warn!(agent = %name, error = %err, "kill failed");
            }
        }
        self.record_mut(name).child = None;
    }

    fn emit(&self, severity: Severity, category: &str, message: String) {
        match severity {
            Severity::Info => info!(category, "{message}"),
            Severity::Warning => warn!(category, "{message}"),
            Severity::Error | Severity::Critical => error!(category, "{message}"),
        }
        self.reporter.publish(severity, category, message, None);
    }

    fn record(&self, name: &AgentName) -> &AgentRecord {
        self.records.get(name).expect("record exists for manifest agent")
    }

    fn record_mut(&mut self, name: &AgentName) -> &mut AgentRecord {
        self.records
            .get_mut(name)
            .expect("record exists for manifest agent")
    }
}

/// Serves the operator query endpoint, forwarding commands to the
/// supervisor loop over a channel.
async fn serve_queries(
    pool: EndpointPool,
    bind: EndpointAddress,
    commands: mpsc::Sender<Command>,
    group: String,
    shutdown: CancellationToken,
) {
    let options = EndpointOptions {
        recv_timeout: Duration::from_millis(250),
        ..EndpointOptions::default()
    };
    let endpoint = match pool.acquire(EndpointKind::Reply, &bind, options).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!(error = %err, bind = %bind, "query endpoint bind failed");
            return;
        }
    };
    info!(bind = %bind, "query endpoint serving");

    while !shutdown.is_cancelled() {
        let request = match endpoint.recv_request().await {
            Ok(request) => request,
            Err(EndpointError::Timeout { .. }) => continue,
            Err(err) => {
                warn!(error = %err, "query receive failed");
                continue;
            }
        };
        let reply = dispatch_query(&request, &commands, &group).await;
        if let Err(err) = endpoint.send_reply(&reply).await {
            warn!(error = %err, "query reply failed");
        }
    }
    if let Err(err) = pool.release(endpoint).await {
        warn!(error = %err, "query endpoint release failed");
    }
}

async fn dispatch_query(
    raw: &[u8],
    commands: &mpsc::Sender<Command>,
    group: &str,
) -> Vec<u8> {
    let request: SupervisorRequest = match wire::decode(raw) {
        Ok(request) => request,
        Err(err) => {
            return encode_or_empty(&CommandReply::Error {
                fault: ErrorBody::new(fault::BAD_REQUEST, err.to_string()),
            });
        }
    };
    match request {
        SupervisorRequest::Status {} => {
            let (tx, rx) = oneshot::channel();
            if commands.send(Command::Status(tx)).await.is_err() {
                return encode_or_empty(&StatusReply::Error {
                    fault: ErrorBody::new(fault::UNAVAILABLE, "supervisor stopping"),
                });
            }
            match rx.await {
                Ok(agents) => encode_or_empty(&StatusReply::Ok {
                    group: group.to_string(),
                    agents,
                }),
                Err(_) => encode_or_empty(&StatusReply::Error {
                    fault: ErrorBody::new(fault::UNAVAILABLE, "supervisor stopping"),
                }),
            }
        }
        SupervisorRequest::StopAgent { name } => {
            forward_command(commands, name, Command::Stop).await
        }
        SupervisorRequest::StartAgent { name } => {
            forward_command(commands, name, Command::Start).await
        }
    }
}

async fn forward_command<F>(
    commands: &mpsc::Sender<Command>,
    name: String,
    build: F,
) -> Vec<u8>
where
    F: FnOnce(AgentName, oneshot::Sender<Result<(), String>>) -> Command,
{
    let Ok(name) = AgentName::new(name.clone()) else {
        return encode_or_empty(&CommandReply::Error {
            fault: ErrorBody::new(fault::BAD_REQUEST, format!("invalid agent name `{name}`")),
        });
    };
    let (tx, rx) = oneshot::channel();
    if commands.send(build(name, tx)).await.is_err() {
        return encode_or_empty(&CommandReply::Error {
            fault: ErrorBody::new(fault::UNAVAILABLE, "supervisor stopping"),
        });
    }
    match rx.await {
        Ok(Ok(())) => encode_or_empty(&CommandReply::Ok {}),
        Ok(Err(reason)) => encode_or_empty(&CommandReply::Error {
            fault: ErrorBody::new(fault::BAD_REQUEST, reason),
        }),
        Err(_) => encode_or_empty(&CommandReply::Error {
            fault: ErrorBody::new(fault::UNAVAILABLE, "supervisor stopping"),
        }),
    }
}

fn encode_or_empty<T: serde::Serialize>(reply: &T) -> Vec<u8> {
    wire::encode(reply).unwrap_or_default()
}
