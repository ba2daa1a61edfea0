//! The digital twin service: bus subscription, probing, queries.

use std::time::Duration;

use fabric_discovery::DiscoveryClient;
use fabric_net::wire::{self, ErrorBody, fault};
use fabric_net::{EndpointError, EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{
    AgentName, EndpointAddress, ErrorEvent, HealthSnapshot, MachineId, topic,
};
use fabric_registry::ServiceEntry;
use fabric_runtime::protocol::ProbeRequest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    RecentErrorsReply, StatusAllReply, StatusReply, TwinRequest, transition_topic,
};
use crate::view::{TwinConfig, TwinView};

/// How long one receive waits before re-checking the shutdown token.
const IDLE_RECV: Duration = Duration::from_millis(250);

/// Twin service configuration.
#[derive(Clone, Debug)]
pub struct TwinServiceConfig {
    /// Bus backend the twin subscribes to.
    pub bus_backend: EndpointAddress,
    /// Address of the twin's query endpoint.
    pub query_bind: EndpointAddress,
    /// Address of the twin's transition publish endpoint, when enabled.
    pub transitions_bind: Option<EndpointAddress>,
    /// View behaviour knobs.
    pub view: TwinConfig,
}

/// The digital twin process.
///
/// Subscribes to every bus event, probes every registry-listed agent with
/// `full` probes, and exposes the aggregated view through a query endpoint
/// plus a transition broadcast.
pub struct DigitalTwin {
    config: TwinServiceConfig,
    discovery: Option<DiscoveryClient>,
    pool: EndpointPool,
}

enum Input {
    Event(ErrorEvent),
    Snapshot(MachineId, AgentName, HealthSnapshot),
    Query(Vec<u8>, tokio::sync::oneshot::Sender<Vec<u8>>),
}

impl DigitalTwin {
    /// Creates the twin over its own endpoint pool.
    #[must_use]
    pub fn new(config: TwinServiceConfig, discovery: Option<DiscoveryClient>) -> Self {
        Self {
            config,
            discovery,
            pool: EndpointPool::new(),
        }
    }

    /// Runs the twin until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointError`] when a required endpoint cannot be
    /// created at startup.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EndpointError> {
        let (input_tx, mut input_rx) = mpsc::channel::<Input>(1024);

        // Bus subscription feeds events into the state loop.
        let subscriber = self
            .pool
            .acquire(
                EndpointKind::Subscribe,
                &self.config.bus_backend,
                EndpointOptions::default(),
            )
            .await?;
        subscriber.subscribe(topic::ALL).await?;
        let sub_worker = {
            let events = input_tx.clone();
            let token = shutdown.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                while !token.is_cancelled() {
                    match tokio::time::timeout(IDLE_RECV, subscriber.next_published()).await {
                        Ok(Ok(published)) => {
                            match wire::decode::<ErrorEvent>(&published.payload) {
                                Ok(event) => {
                                    if events.send(Input::Event(event)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    debug!(error = %err, topic = %published.topic, "undecodable bus event");
                                }
                            }
                        }
                        Ok(Err(err)) => warn!(error = %err, "bus receive failed"),
                        Err(_) => {}
                    }
                }
                if let Err(err) = pool.release(subscriber).await {
                    debug!(error = %err, "bus subscription release failed");
                }
            })
        };

        // Periodic full probes of every agent the registry knows.
        let probe_worker = self.discovery.clone().map(|discovery| {
            let probes = input_tx.clone();
            let pool = self.pool.clone();
            let interval = self.config.view.probe_interval;
            let token = shutdown.clone();
            tokio::spawn(async move {
                run_probe_loop(discovery, pool, probes, interval, token).await;
            })
        });

        // Query endpoint forwards raw requests into the state loop.
        let query_worker = {
            let pool = self.pool.clone();
            let bind = self.config.query_bind.clone();
            let queries = input_tx.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                serve_queries(pool, bind, queries, token).await;
            })
        };
        drop(input_tx);

        // Transition broadcast, when configured.
        let transitions = match &self.config.transitions_bind {
            Some(bind) => Some(
                self.pool
                    .acquire(EndpointKind::Publish, bind, EndpointOptions::default())
                    .await?,
            ),
            None => None,
        };

        info!(
            bus = %self.config.bus_backend,
            query = %self.config.query_bind,
            "digital twin running"
        );

        // State loop: exclusive owner of the view.
        let mut view = TwinView::new(self.config.view.clone());
        let mut sweep = tokio::time::interval(self.config.view.grace.min(Duration::from_secs(10)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let transition = tokio::select! {
                () = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    for transition in view.sweep() {
                        broadcast_transition(transitions.as_ref(), &transition).await;
                    }
                    None
                }
                input = input_rx.recv() => match input {
                    None => break,
                    Some(Input::Event(event)) => view.record_event(event),
                    Some(Input::Snapshot(machine, agent, snapshot)) => {
                        view.record_snapshot(machine, agent, snapshot)
                    }
                    Some(Input::Query(raw, reply)) => {
                        let _ = reply.send(answer_query(&view, &raw));
                        None
                    }
                },
            };
            if let Some(transition) = transition {
                broadcast_transition(transitions.as_ref(), &transition).await;
            }
        }

        // The workers observe the token within one receive slice; give them
        // that long before abandoning them.
        for worker in [Some(sub_worker), probe_worker, Some(query_worker)]
            .into_iter()
            .flatten()
        {
            if tokio::time::timeout(Duration::from_secs(2), worker).await.is_err() {
                warn!("twin worker did not stop within grace");
            }
        }
        if let Some(handle) = transitions {
            let _ = self.pool.release(handle).await;
        }
        self.pool.close_all().await;
        info!("digital twin stopped");
        Ok(())
    }
}

async fn broadcast_transition(
    transitions: Option<&fabric_net::EndpointHandle>,
    transition: &crate::view::HealthTransition,
) {
    info!(
        machine = %transition.machine,
        agent = %transition.agent,
        from = ?transition.from,
        to = ?transition.to,
        "health transition"
    );
    let Some(handle) = transitions else {
        return;
    };
    let Ok(payload) = wire::encode(transition) else {
        return;
    };
    let topic = transition_topic(transition.machine.as_str(), transition.agent.as_str());
    if let Err(err) = handle.publish(&topic, &payload).await {
        debug!(error = %err, "transition publish failed");
    }
}

/// Probes every registry-listed agent with a `full` probe each interval.
async fn run_probe_loop(
    discovery: DiscoveryClient,
    pool: EndpointPool,
    probes: mpsc::Sender<Input>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while !shutdown.is_cancelled() {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let entries = match discovery.list(None).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, "registry list failed");
                continue;
            }
        };
        for entry in entries {
            if shutdown.is_cancelled() {
                return;
            }
            match full_probe(&pool, &entry).await {
                Ok(snapshot) => {
                    let machine = machine_of(&entry);
                    let input =
                        Input::Snapshot(machine, entry.name().clone(), snapshot);
                    if probes.send(input).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(agent = %entry.name(), error = %err, "full probe failed");
                }
            }
        }
    }
}

/// Issues one `full` probe against an entry's health endpoint.
async fn full_probe(
    pool: &EndpointPool,
    entry: &ServiceEntry,
) -> Result<HealthSnapshot, String> {
    let options = EndpointOptions::default().with_timeouts(Duration::from_secs(2));
    let handle = pool
        .acquire(EndpointKind::Request, entry.health_endpoint(), options)
        .await
        .map_err(|e| e.to_string())?;
    let payload = wire::encode(&ProbeRequest::Full {}).map_err(|e| e.to_string())?;
    match handle.request(&payload).await {
        Ok(reply) => {
            if let Err(err) = pool.release(handle).await {
                debug!(error = %err, "probe endpoint release failed");
            }
            wire::decode::<HealthSnapshot>(&reply).map_err(|e| e.to_string())
        }
        Err(err) => {
            pool.discard(handle).await;
            Err(err.to_string())
        }
    }
}

/// Machine an entry belongs to, taken from registry metadata with a local
/// fallback.
fn machine_of(entry: &ServiceEntry) -> MachineId {
    entry
        .metadata()
        .get("machine")
        .and_then(|raw| MachineId::new(raw.clone()).ok())
        .unwrap_or_else(|| MachineId::new("local").expect("static id is valid"))
}

async fn serve_queries(
    pool: EndpointPool,
    bind: EndpointAddress,
    queries: mpsc::Sender<Input>,
    shutdown: CancellationToken,
) {
    let options = EndpointOptions {
        recv_timeout: IDLE_RECV,
        ..EndpointOptions::default()
    };
    let endpoint = match pool.acquire(EndpointKind::Reply, &bind, options).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!(error = %err, bind = %bind, "query endpoint bind failed");
            return;
        }
    };
    while !shutdown.is_cancelled() {
        let request = match endpoint.recv_request().await {
            Ok(request) => request,
            Err(EndpointError::Timeout { .. }) => continue,
            Err(err) => {
                warn!(error = %err, "query receive failed");
                continue;
            }
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        if queries.send(Input::Query(request.to_vec(), tx)).await.is_err() {
            break;
        }
        let reply = rx.await.unwrap_or_default();
        if let Err(err) = endpoint.send_reply(&reply).await {
            warn!(error = %err, "query reply failed");
        }
    }
    if let Err(err) = pool.release(endpoint).await {
        debug!(error = %err, "query endpoint release failed");
    }
}

fn answer_query(view: &TwinView, raw: &[u8]) -> Vec<u8> {
    let request: TwinRequest = match wire::decode(raw) {
        Ok(request) => request,
        Err(err) => {
            return encode_or_empty(&StatusReply::Error {
                fault: ErrorBody::new(fault::BAD_REQUEST, err.to_string()),
            });
        }
    };
    match request {
        TwinRequest::Status { name, machine } => {
            let Ok(agent) = AgentName::new(name.clone()) else {
                return encode_or_empty(&StatusReply::Error {
                    fault: ErrorBody::new(fault::BAD_REQUEST, format!("invalid name `{name}`")),
                });
            };
            let machine = machine
                .and_then(|raw| MachineId::new(raw).ok())
                .or_else(|| {
                    // Without a machine filter, take the first match.
                    view.status_all()
                        .into_iter()
                        .find(|entry| entry.agent == agent)
                        .map(|entry| entry.machine)
                });
            let entry = machine.and_then(|machine| view.status(&machine, &agent));
            match entry {
                Some(entry) => encode_or_empty(&StatusReply::Ok { entry }),
                None => encode_or_empty(&StatusReply::Error {
                    fault: ErrorBody::new(fault::NOT_FOUND, format!("no view of `{agent}`")),
                }),
            }
        }
        TwinRequest::StatusAll {} => encode_or_empty(&StatusAllReply::Ok {
            entries: view.status_all(),
        }),
        TwinRequest::RecentErrors {
            name,
            since,
            severity,
        } => {
            let agent = match name {
                Some(raw) => match AgentName::new(raw.clone()) {
                    Ok(agent) => Some(agent),
                    Err(_) => {
                        return encode_or_empty(&RecentErrorsReply::Error {
                            fault: ErrorBody::new(
                                fault::BAD_REQUEST,
                                format!("invalid name `{raw}`"),
                            ),
                        });
                    }
                },
                None => None,
            };
            encode_or_empty(&RecentErrorsReply::Ok {
                events: view.recent_errors(agent.as_ref(), since, severity),
            })
        }
    }
}

fn encode_or_empty<T: serde::Serialize>(reply: &T) -> Vec<u8> {
    wire::encode(reply).unwrap_or_default()
}
