//! The process driver: bootstrap, serve, drain, exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fabric_config::{Config, ConfigError, ConfigLoader, FabricPaths};
use fabric_discovery::{DiscoveryClient, DiscoveryConfig, Registration};
use fabric_net::wire;
use fabric_net::{EndpointError, EndpointHandle, EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{
    AgentName, ComponentHealth, EndpointAddress, HealthSnapshot, HealthStatus, InstanceId,
    MachineId, Severity,
};
use fabric_registry::ServiceEntry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AgentContext;
use crate::handler::{Agent, HandlerError};
use crate::lifecycle::{Lifecycle, RuntimeEvent};
use crate::protocol::{ControlReply, ControlRequest, ErrorReply, PingReply, ProbeRequest};
use crate::reporter::ErrorReporter;
use crate::tasks::TaskRegistry;

/// Clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Invalid manifest or configuration.
pub const EXIT_CONFIG: i32 = 2;
/// A required agent failed to reach ready (used by the supervisor).
pub const EXIT_REQUIRED: i32 = 3;
/// Internal invariant violation.
pub const EXIT_INTERNAL: i32 = 4;

/// How long one receive waits before re-checking the shutdown token.
const IDLE_RECV: Duration = Duration::from_millis(250);
/// Full snapshots are rebuilt at most this often; probes in between are
/// answered from the cached copy so a blocked agent cannot wedge probes.
const SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(1);
/// Concurrent handler bound for reentrant agents.
const MAX_INFLIGHT_REQUESTS: usize = 32;

/// Result alias for runtime construction.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised while bootstrapping or running an agent process.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration was missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An identifier failed validation.
    #[error(transparent)]
    Invalid(#[from] fabric_primitives::Error),
    /// A required endpoint could not be created.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl RuntimeError {
    /// Maps the error to the documented process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Invalid(_) => EXIT_CONFIG,
            Self::Endpoint(_) => 1,
        }
    }
}

/// Resolved per-process settings derived from configuration.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// This agent's logical name.
    pub name: AgentName,
    /// Machine identifier stamped on events and registry entries.
    pub machine: MachineId,
    /// Host the reply endpoints bind.
    pub bind_host: String,
    /// Host advertised to peers through the registry.
    pub advertise_host: String,
    /// Port of the request endpoint.
    pub request_port: u16,
    /// Port of the health endpoint; defaults to `request_port + 1`.
    pub health_port: u16,
    /// Registry endpoint, when discovery is configured.
    pub registry: Option<EndpointAddress>,
    /// Error-bus frontend, when a bus is configured.
    pub error_bus: Option<EndpointAddress>,
    /// Capability tags advertised on registration.
    pub capabilities: Vec<String>,
    /// Optional publish endpoint advertised to subscribers.
    pub publish_port: Option<u16>,
    /// Grace given to handlers and background tasks at shutdown.
    pub shutdown_grace: Duration,
    /// Heartbeat cadence for TTL-based registries.
    pub refresh_interval: Option<Duration>,
    /// Whether the agent declared itself reentrant.
    pub reentrant: bool,
    /// Maximum accepted request size.
    pub max_message_bytes: usize,
}

impl RuntimeOptions {
    /// Derives options from a merged configuration snapshot.
    ///
    /// `request_port` is required; everything else falls back to documented
    /// defaults. The supervisor supplies these keys through `FABRIC_*`
    /// environment variables when spawning.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] for missing or mistyped keys.
    pub fn from_config(name: AgentName, config: &Config) -> RuntimeResult<Self> {
        let request_port = port(config.require_int("request_port")?, "request_port")?;
        let health_port = match config.as_int("health_port") {
            Some(value) => port(value, "health_port")?,
            None => request_port
                .checked_add(1)
                .ok_or(ConfigError::WrongType {
                    key: "request_port".into(),
                    expected: "a port with room for the adjacent health port",
                })?,
        };
        let bind_host = config
            .as_string("bind_host")
            .unwrap_or_else(|| "127.0.0.1".into());
        let advertise_host = config
            .as_string("advertise_host")
            .unwrap_or_else(|| bind_host.clone());
        let machine = MachineId::new(
            config
                .as_string("machine_id")
                .unwrap_or_else(|| "local".into()),
        )?;
        let registry = parse_endpoint(config, "registry.endpoint")?;
        let error_bus = parse_endpoint(config, "error_bus.frontend")?;
        let capabilities = config
            .as_string("capabilities")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let publish_port = match config.as_int("publish_port") {
            Some(value) => Some(port(value, "publish_port")?),
            None => None,
        };
        Ok(Self {
            name,
            machine,
            bind_host,
            advertise_host,
            request_port,
            health_port,
            registry,
            error_bus,
            capabilities,
            publish_port,
            shutdown_grace: config
                .as_duration("shutdown_grace")
                .unwrap_or(Duration::from_secs(10)),
            refresh_interval: config.as_duration("registry.refresh"),
            reentrant: config.as_bool("reentrant").unwrap_or(false),
            max_message_bytes: config
                .as_int("max_message_bytes")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(wire::MAX_MESSAGE_BYTES),
        })
    }
}

fn port(value: i64, key: &str) -> RuntimeResult<u16> {
    u16::try_from(value).map_err(|_| {
        RuntimeError::Config(ConfigError::WrongType {
            key: key.to_string(),
            expected: "a 16-bit port",
        })
    })
}

fn parse_endpoint(config: &Config, key: &str) -> RuntimeResult<Option<EndpointAddress>> {
    config
        .as_string(key)
        .map(|raw| raw.parse::<EndpointAddress>())
        .transpose()
        .map_err(RuntimeError::from)
}

struct HealthState {
    started: Instant,
    serving: AtomicBool,
    registered: AtomicBool,
}

/// The per-process runtime every fabric agent embeds.
///
/// Owns the lifecycle: configuration, endpoint acquisition, the request and
/// health loops, background tasks, error reporting, and graceful shutdown.
pub struct AgentRuntime<A: Agent> {
    agent: Arc<A>,
    options: RuntimeOptions,
    config: Config,
    paths: FabricPaths,
}

impl<A: Agent> AgentRuntime<A> {
    /// Bootstraps from the process environment: resolves directories, loads
    /// the merged configuration, and derives runtime options.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] on any configuration problem; the
    /// caller should exit with [`RuntimeError::exit_code`].
    pub fn bootstrap(name: &str, agent: A) -> RuntimeResult<Self> {
        let name = AgentName::new(name)?;
        let paths = FabricPaths::resolve()?;
        let config = ConfigLoader::new(paths.clone())
            .with_args(std::env::args().skip(1))
            .load(name.as_str())?;
        let options = RuntimeOptions::from_config(name, &config)?;
        Ok(Self {
            agent: Arc::new(agent),
            options,
            config,
            paths,
        })
    }

    /// Constructs a runtime from explicit parts, bypassing environment
    /// resolution. Used by tests and embedded deployments.
    #[must_use]
    pub fn with_options(
        agent: A,
        options: RuntimeOptions,
        config: Config,
        paths: FabricPaths,
    ) -> Self {
        Self {
            agent: Arc::new(agent),
            options,
            config,
            paths,
        }
    }

    /// Runs the agent to completion, returning the process exit code.
    pub async fn run(self) -> i32 {
        let mut lifecycle = Lifecycle::new(self.options.name.clone());
        if lifecycle.transition(RuntimeEvent::Bootstrap).is_err() {
            return EXIT_INTERNAL;
        }

        let shutdown = CancellationToken::new();
        let health_stop = CancellationToken::new();
        let pool = EndpointPool::new();
        let (reporter, reporter_worker) = ErrorReporter::spawn(
            pool.clone(),
            self.options.error_bus.clone(),
            self.options.name.clone(),
            self.options.machine.clone(),
            1000,
        );
        let instance = InstanceId::random();
        let discovery = self.options.registry.clone().map(|registry| {
            DiscoveryClient::new(pool.clone(), DiscoveryConfig::new(registry))
        });
        let tasks = TaskRegistry::new(shutdown.clone());
        // Shared so reentrant handler tasks can hold it across awaits.
        let ctx = Arc::new(AgentContext::new(
            self.options.name.clone(),
            self.options.machine.clone(),
            instance,
            self.config.clone(),
            self.paths.clone(),
            pool.clone(),
            discovery.clone(),
            reporter.clone(),
            tasks.clone(),
            self.options.reentrant,
        ));

        let health_state = Arc::new(HealthState {
            started: Instant::now(),
            serving: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        });

        // Bind both reply endpoints before running agent code, so a port
        // clash fails fast.
        let request_address = match EndpointAddress::new(
            self.options.bind_host.clone(),
            self.options.request_port,
        ) {
            Ok(address) => address,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };
        let serve_options = EndpointOptions {
            recv_timeout: IDLE_RECV,
            routed_reply: self.options.reentrant,
            ..EndpointOptions::default()
        };
        let request_endpoint = match pool
            .acquire(EndpointKind::Reply, &request_address, serve_options)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };

        let health_address = match request_address.with_port(self.options.health_port) {
            Ok(address) => address,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };
        let health_worker = {
            let pool = pool.clone();
            let agent = Arc::clone(&self.agent);
            let state = Arc::clone(&health_state);
            let reporter = reporter.clone();
            let shutdown = shutdown.clone();
            let stop = health_stop.clone();
            tokio::spawn(async move {
                run_health_loop(pool, health_address, agent, state, reporter, shutdown, stop)
                    .await;
            })
        };

        // Optional publish endpoint, advertised through registry metadata.
        let publish_endpoint = match self.bind_publish(&pool).await {
            Ok(endpoint) => endpoint,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };

        if let Err(err) = self.agent.on_start(&ctx).await {
            return startup_failure(&ctx, &format!("on_start failed: {err}")).await;
        }

        let advertised_request = match EndpointAddress::new(
            self.options.advertise_host.clone(),
            self.options.request_port,
        ) {
            Ok(address) => address,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };
        let advertised_health = match advertised_request.with_port(self.options.health_port) {
            Ok(address) => address,
            Err(err) => return startup_failure(&ctx, &err.to_string()).await,
        };

        let registration = match self
            .register(
                &ctx,
                instance,
                discovery.as_ref(),
                advertised_request,
                advertised_health,
            )
            .await
        {
            Ok(registration) => {
                if registration.is_some() {
                    health_state.registered.store(true, Ordering::Release);
                }
                registration
            }
            Err(err) => {
                // The registry being down is survivable; the heartbeat
                // worker re-registers once it answers again.
                warn!(error = %err, "initial registration failed");
                ctx.publish_error(
                    Severity::Warning,
                    "discovery",
                    format!("initial registration failed: {err}"),
                    None,
                );
                None
            }
        };

        if lifecycle.transition(RuntimeEvent::Serve).is_err() {
            return EXIT_INTERNAL;
        }
        health_state.serving.store(true, Ordering::Release);
        install_signal_handler(&shutdown);
        info!(
            agent = %self.options.name,
            request = %request_address,
            health_port = self.options.health_port,
            "agent serving"
        );

        // Health lives on its own task, so probes keep answering while a
        // handler runs. Dispatch is strictly serialized unless the agent
        // opted into reentrancy, in which case handlers overlap on a routed
        // reply endpoint and replies go out as they finish.
        let request_endpoint = if self.options.reentrant {
            serve_routed(
                &self.agent,
                &ctx,
                Arc::new(request_endpoint),
                &shutdown,
                self.options.max_message_bytes,
                self.options.shutdown_grace,
            )
            .await
        } else {
            serve_serialized(
                self.agent.as_ref(),
                &ctx,
                &request_endpoint,
                &shutdown,
                self.options.max_message_bytes,
            )
            .await;
            Some(request_endpoint)
        };

        // Drain.
        if lifecycle.transition(RuntimeEvent::Drain).is_err() {
            return EXIT_INTERNAL;
        }
        health_state.serving.store(false, Ordering::Release);
        info!(agent = %self.options.name, "draining");

        if let Err(err) = self.agent.on_stop(&ctx).await {
            warn!(error = %err, "on_stop failed");
            ctx.publish_error(
                Severity::Warning,
                "lifecycle",
                format!("on_stop failed: {err}"),
                None,
            );
        }

        if let Some(registration) = registration {
            if let Err(err) = registration.stop().await {
                warn!(error = %err, "deregistration failed");
            }
        }

        let unterminated = ctx.tasks().shutdown(self.options.shutdown_grace).await;
        if unterminated > 0 {
            ctx.publish_error(
                Severity::Warning,
                "lifecycle",
                format!("{unterminated} background tasks did not stop within grace"),
                None,
            );
        }

        // Health answers to the last moment, then everything unwinds in
        // reverse acquisition order.
        health_stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), health_worker).await;
        match request_endpoint {
            Some(handle) => {
                if let Err(err) = pool.release(handle).await {
                    warn!(error = %err, "request endpoint release failed");
                }
            }
            // A handler that outlived the drain still holds the endpoint;
            // close_all below shuts it down with the pool.
            None => warn!("request endpoint still held by an in-flight handler"),
        }
        if let Some(handle) = publish_endpoint {
            if let Err(err) = pool.release(handle).await {
                warn!(error = %err, "publish endpoint release failed");
            }
        }
        drop(ctx);
        drop(reporter);
        let _ = tokio::time::timeout(Duration::from_secs(2), reporter_worker).await;
        pool.close_all().await;

        if lifecycle.transition(RuntimeEvent::Stop).is_err() {
            return EXIT_INTERNAL;
        }
        info!(agent = %self.options.name, "stopped");
        if unterminated > 0 { 1 } else { EXIT_OK }
    }

    async fn bind_publish(
        &self,
        pool: &EndpointPool,
    ) -> Result<Option<fabric_net::EndpointHandle>, EndpointError> {
        let Some(port) = self.options.publish_port else {
            return Ok(None);
        };
        let address = EndpointAddress::new(self.options.bind_host.clone(), port)
            .map_err(|err| EndpointError::MalformedFrame {
                address: format!("{}:{port}", self.options.bind_host),
                reason: err.to_string(),
            })?;
        let handle = pool
            .acquire(EndpointKind::Publish, &address, EndpointOptions::default())
            .await?;
        Ok(Some(handle))
    }

    async fn register(
        &self,
        ctx: &AgentContext,
        instance: InstanceId,
        discovery: Option<&DiscoveryClient>,
        request: EndpointAddress,
        health: EndpointAddress,
    ) -> Result<Option<Registration>, fabric_discovery::DiscoveryError> {
        let Some(discovery) = discovery else {
            return Ok(None);
        };
        let mut entry =
            ServiceEntry::new(self.options.name.clone(), instance, request, health)
                .with_metadata("machine", self.options.machine.as_str());
        for capability in &self.options.capabilities {
            entry = entry.with_capability(capability.clone());
        }
        if let Some(port) = self.options.publish_port {
            entry = entry.with_metadata(
                "publish_endpoint",
                format!("tcp://{}:{port}", self.options.advertise_host),
            );
        }
        let registration = discovery
            .register_self(entry, self.options.refresh_interval)
            .await?;
        info!(agent = %ctx.name(), "registered with registry");
        Ok(Some(registration))
    }
}

/// Reports a startup failure as a `Critical` event and returns the exit
/// code. The short wait lets the reporter worker flush the event before
/// the process exits.
async fn startup_failure(ctx: &AgentContext, detail: &str) -> i32 {
    error!(agent = %ctx.name(), detail, "startup failed");
    ctx.publish_error(Severity::Critical, "lifecycle", detail, None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    1
}

fn encode_error(err: &HandlerError) -> Vec<u8> {
    wire::encode(&ErrorReply::from_handler(err)).unwrap_or_default()
}

/// Runs one request through the size cap and the agent's handler, turning
/// failures into structured error replies plus bus events.
async fn handle_payload<A: Agent>(
    agent: &A,
    ctx: &AgentContext,
    payload: Bytes,
    limit: usize,
) -> Vec<u8> {
    if payload.len() > limit {
        let err = HandlerError::MessageTooLarge {
            size: payload.len(),
            limit,
        };
        ctx.publish_error(Severity::Error, "handler", err.to_string(), None);
        return encode_error(&err);
    }
    match agent.on_request(ctx, payload).await {
        Ok(reply) => reply,
        Err(err) => {
            ctx.publish_error(Severity::Error, "handler", err.to_string(), None);
            encode_error(&err)
        }
    }
}

/// Default dispatch: one request at a time, reply before the next receive,
/// so `on_request` never observes overlapping calls.
async fn serve_serialized<A: Agent>(
    agent: &A,
    ctx: &AgentContext,
    endpoint: &EndpointHandle,
    shutdown: &CancellationToken,
    limit: usize,
) {
    while !shutdown.is_cancelled() {
        let payload = match endpoint.recv_request().await {
            Ok(payload) => payload,
            Err(EndpointError::Timeout { .. }) => continue,
            Err(err) => {
                warn!(error = %err, "request receive failed");
                continue;
            }
        };
        let reply = handle_payload(agent, ctx, payload, limit).await;
        if let Err(err) = endpoint.send_reply(&reply).await {
            warn!(error = %err, "reply send failed");
        }
    }
}

/// Opt-in reentrant dispatch: each request runs on its own task under a
/// bounded in-flight budget, and replies are routed back to their peers in
/// completion order. Per-peer ordering still holds because request-kind
/// peers are lock-step.
///
/// Returns the endpoint handle once in-flight handlers have drained, or
/// `None` when one outlived the grace period and still holds it.
async fn serve_routed<A: Agent>(
    agent: &Arc<A>,
    ctx: &Arc<AgentContext>,
    endpoint: Arc<EndpointHandle>,
    shutdown: &CancellationToken,
    limit: usize,
    grace: Duration,
) -> Option<EndpointHandle> {
    let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_INFLIGHT_REQUESTS));
    while !shutdown.is_cancelled() {
        let routed = match endpoint.recv_routed().await {
            Ok(routed) => routed,
            Err(EndpointError::Timeout { .. }) => continue,
            Err(err) => {
                warn!(error = %err, "request receive failed");
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
            break;
        };
        let agent = Arc::clone(agent);
        let ctx = Arc::clone(ctx);
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let payload = routed.payload.clone();
            let reply = handle_payload(agent.as_ref(), &ctx, payload, limit).await;
            if let Err(err) = endpoint.send_routed(&routed, &reply).await {
                warn!(error = %err, "routed reply send failed");
            }
            drop(permit);
        });
    }

    // Wait for in-flight handlers, then reclaim the shared handle.
    let drained = tokio::time::timeout(
        grace,
        limiter.acquire_many(u32::try_from(MAX_INFLIGHT_REQUESTS).unwrap_or(u32::MAX)),
    )
    .await;
    match drained {
        Ok(Ok(permits)) => drop(permits),
        Ok(Err(_)) | Err(_) => {
            warn!("reentrant handlers still running after grace");
        }
    }
    tokio::task::yield_now().await;
    Arc::try_unwrap(endpoint).ok()
}

fn install_signal_handler(shutdown: &CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            token.cancel();
        }
    });
}

#[allow(clippy::too_many_lines)]
async fn run_health_loop<A: Agent>(
    pool: EndpointPool,
    address: EndpointAddress,
    agent: Arc<A>,
    state: Arc<HealthState>,
    reporter: ErrorReporter,
    shutdown: CancellationToken,
    stop: CancellationToken,
) {
    let options = EndpointOptions {
        recv_timeout: Duration::from_millis(100),
        ..EndpointOptions::default()
    };
    let endpoint = match pool.acquire(EndpointKind::Reply, &address, options).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!(error = %err, address = %address, "health endpoint bind failed");
            shutdown.cancel();
            return;
        }
    };

    let mut cached: Option<(Instant, HealthSnapshot)> = None;
    while !stop.is_cancelled() {
        let request = match endpoint.recv_request().await {
            Ok(request) => request,
            Err(EndpointError::Timeout { .. }) => continue,
            Err(err) => {
                warn!(error = %err, "health receive failed");
                continue;
            }
        };

        let uptime = state.started.elapsed().as_secs();
        let reply: Vec<u8> = if let Ok(probe) = wire::decode::<ProbeRequest>(&request) {
            match probe {
                ProbeRequest::Ping {} => wire::encode(&PingReply::ok(uptime)).unwrap_or_default(),
                ProbeRequest::Full {} => {
                    let fresh = cached
                        .as_ref()
                        .is_some_and(|(at, _)| at.elapsed() < SNAPSHOT_MAX_AGE);
                    if !fresh {
                        let snapshot =
                            build_snapshot(&pool, agent.as_ref(), &state, &reporter, uptime).await;
                        cached = Some((Instant::now(), snapshot));
                    }
                    let (_, snapshot) = cached.as_ref().expect("snapshot cached above");
                    wire::encode(snapshot).unwrap_or_default()
                }
            }
        } else if let Ok(ControlRequest::Stop {}) = wire::decode::<ControlRequest>(&request) {
            info!("control stop received");
            shutdown.cancel();
            wire::encode(&ControlReply::ok()).unwrap_or_default()
        } else {
            wire::encode(&ErrorReply::from_handler(&HandlerError::bad_request(
                "expected a probe or control message",
            )))
            .unwrap_or_default()
        };

        if let Err(err) = endpoint.send_reply(&reply).await {
            warn!(error = %err, "health reply failed");
        }
    }

    if let Err(err) = pool.release(endpoint).await {
        warn!(error = %err, "health endpoint release failed");
    }
}

async fn build_snapshot<A: Agent>(
    pool: &EndpointPool,
    agent: &A,
    state: &HealthState,
    reporter: &ErrorReporter,
    uptime: u64,
) -> HealthSnapshot {
    let mut checks = std::collections::BTreeMap::new();
    let serving = state.serving.load(Ordering::Acquire);
    checks.insert(
        "self".to_string(),
        if serving {
            ComponentHealth::ok()
        } else {
            ComponentHealth::with_detail(HealthStatus::Degraded, "not serving")
        },
    );
    let live = pool.live_endpoints().await;
    checks.insert(
        "endpoints".to_string(),
        if live > 0 {
            ComponentHealth::ok()
        } else {
            ComponentHealth::with_detail(HealthStatus::Degraded, "no live endpoints")
        },
    );
    checks.insert(
        "registry".to_string(),
        if state.registered.load(Ordering::Acquire) {
            ComponentHealth::ok()
        } else {
            ComponentHealth::with_detail(HealthStatus::Degraded, "not registered")
        },
    );
    for (name, check) in agent.health_components() {
        checks.insert(name, check);
    }

    let mut metrics = std::collections::BTreeMap::new();
    metrics.insert("live_endpoints".to_string(), live as f64);
    metrics.insert("dropped_error_events".to_string(), reporter.dropped() as f64);
    HealthSnapshot::from_checks(uptime, checks, metrics)
}
