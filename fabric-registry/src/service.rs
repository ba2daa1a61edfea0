//! Reply-endpoint service wrapping a registry backend.

use std::sync::Arc;
use std::time::Duration;

use fabric_net::wire::{self, ErrorBody, fault};
use fabric_net::{EndpointError, EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress, ErrorEvent, MachineId, Severity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, RegistryBackend};
use crate::protocol::{AckReply, ListReply, LookupReply, RegistryRequest, fault_for};

/// How long one receive waits before re-checking the shutdown token.
const IDLE_RECV: Duration = Duration::from_millis(250);

/// Configuration for [`RegistryService`].
#[derive(Clone, Debug)]
pub struct RegistryServiceConfig {
    /// Address the reply endpoint binds.
    pub bind: EndpointAddress,
    /// Machine this registry runs on, stamped on published events.
    pub machine: MachineId,
    /// Error-bus frontend to publish backend failures to, when present.
    pub error_bus: Option<EndpointAddress>,
}

/// The registry process: one reply endpoint over one backend.
pub struct RegistryService {
    backend: Arc<dyn RegistryBackend>,
    config: RegistryServiceConfig,
    pool: EndpointPool,
    name: AgentName,
    event_seq: std::sync::atomic::AtomicU64,
}

impl RegistryService {
    /// Creates the service over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn RegistryBackend>, config: RegistryServiceConfig) -> Self {
        Self {
            backend,
            config,
            pool: EndpointPool::new(),
            name: AgentName::new("service-registry").expect("static name is valid"),
            event_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Serves requests until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointError`] when the reply endpoint cannot be bound;
    /// transport errors on individual exchanges are logged and served past.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EndpointError> {
        let options = EndpointOptions {
            recv_timeout: IDLE_RECV,
            ..EndpointOptions::default()
        };
        let endpoint = self
            .pool
            .acquire(EndpointKind::Reply, &self.config.bind, options)
            .await?;
        info!(bind = %self.config.bind, "registry serving");

        while !shutdown.is_cancelled() {
            let request = match endpoint.recv_request().await {
                Ok(request) => request,
                Err(EndpointError::Timeout { .. }) => continue,
                Err(err) => {
                    warn!(error = %err, "receive failed");
                    continue;
                }
            };
            let reply = self.dispatch(&request).await;
            if let Err(err) = endpoint.send_reply(&reply).await {
                warn!(error = %err, "reply failed");
            }
        }

        self.pool.release(endpoint).await?;
        self.pool.close_all().await;
        info!("registry stopped");
        Ok(())
    }

    async fn dispatch(&self, raw: &[u8]) -> Vec<u8> {
        let request: RegistryRequest = match wire::decode(raw) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "undecodable request");
                let reply = AckReply::Error {
                    fault: ErrorBody::new(fault::BAD_REQUEST, err.to_string()),
                };
                return encode_reply(&reply);
            }
        };

        match request {
            RegistryRequest::Register { entry } => {
                let agent = entry.name().clone();
                match self.backend.register(entry).await {
                    Ok(()) => {
                        debug!(agent = %agent, "registered");
                        encode_reply(&AckReply::ok())
                    }
                    Err(err) => self.backend_fault_ack(&err).await,
                }
            }
            RegistryRequest::Deregister { name } => match self.backend.deregister(&name).await {
                Ok(()) => encode_reply(&AckReply::ok()),
                Err(err) => self.backend_fault_ack(&err).await,
            },
            RegistryRequest::Lookup { name } => match self.backend.lookup(&name).await {
                Ok(entry) => encode_reply(&LookupReply::Ok { entry }),
                Err(err) => {
                    self.report_backend_failure(&err).await;
                    encode_reply(&LookupReply::Error {
                        fault: fault_for(&err),
                    })
                }
            },
            RegistryRequest::List { capability } => {
                match self.backend.list(capability.as_deref()).await {
                    Ok(entries) => encode_reply(&ListReply::Ok { entries }),
                    Err(err) => {
                        self.report_backend_failure(&err).await;
                        encode_reply(&ListReply::Error {
                            fault: fault_for(&err),
                        })
                    }
                }
            }
            RegistryRequest::Heartbeat { name } => match self.backend.heartbeat(&name).await {
                Ok(()) => encode_reply(&AckReply::ok()),
                Err(err) => self.backend_fault_ack(&err).await,
            },
        }
    }

    async fn backend_fault_ack(&self, err: &BackendError) -> Vec<u8> {
        self.report_backend_failure(err).await;
        encode_reply(&AckReply::Error {
            fault: fault_for(err),
        })
    }

    /// Publishes store failures to the error bus, best effort. Expected
    /// outcomes such as `NotFound` and `Conflict` stay local.
    async fn report_backend_failure(&self, err: &BackendError) {
        let severity = match err {
            BackendError::Backend { .. } => Severity::Error,
            BackendError::Unavailable { .. } => Severity::Warning,
            _ => return,
        };
        let Some(bus) = &self.config.error_bus else {
            return;
        };
        let seq = self
            .event_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let event = ErrorEvent::builder(self.name.clone(), self.config.machine.clone(), severity)
            .category("backend")
            .and_then(|b| b.message(err.to_string()))
            .map(|b| b.event_id(seq))
            .and_then(|b| b.build());
        let Ok(event) = event else {
            return;
        };
        let options = EndpointOptions::default()
            .with_bind(false)
            .with_timeouts(Duration::from_millis(500));
        match self
            .pool
            .acquire(EndpointKind::Publish, bus, options)
            .await
        {
            Ok(handle) => {
                if let Ok(payload) = wire::encode(&event) {
                    if let Err(publish_err) = handle.publish(&event.topic(), &payload).await {
                        debug!(error = %publish_err, "error bus publish failed");
                    }
                }
                if let Err(release_err) = self.pool.release(handle).await {
                    debug!(error = %release_err, "error bus release failed");
                }
            }
            Err(acquire_err) => {
                debug!(error = %acquire_err, "error bus unreachable");
            }
        }
    }
}

fn encode_reply<T: serde::Serialize>(reply: &T) -> Vec<u8> {
    wire::encode(reply).unwrap_or_else(|err| {
        error!(error = %err, "reply encoding failed");
        // A minimal hand-built error reply; must never itself fail.
        wire::encode(&AckReply::Error {
            fault: ErrorBody::new(fault::BACKEND_ERROR, "reply encoding failed"),
        })
        .expect("static error reply encodes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_primitives::InstanceId;

    use crate::entry::ServiceEntry;
    use crate::memory::InMemoryBackend;

    fn service(bind_port: u16) -> RegistryService {
        RegistryService::new(
            Arc::new(InMemoryBackend::new()),
            RegistryServiceConfig {
                bind: EndpointAddress::new("127.0.0.1", bind_port).unwrap(),
                machine: MachineId::new("testmachine").unwrap(),
                error_bus: None,
            },
        )
    }

    fn entry(name: &str, port: u16) -> ServiceEntry {
        ServiceEntry::new(
            AgentName::new(name).unwrap(),
            InstanceId::random(),
            EndpointAddress::new("127.0.0.1", port).unwrap(),
            EndpointAddress::new("127.0.0.1", port + 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn dispatch_register_lookup_deregister() {
        let service = service(29_501);
        let e = entry("asr", 6100);

        let raw = wire::encode(&RegistryRequest::Register { entry: e.clone() }).unwrap();
        let reply: AckReply = wire::decode(&service.dispatch(&raw).await).unwrap();
        assert!(reply.is_ok());

        let raw = wire::encode(&RegistryRequest::Lookup {
            name: e.name().clone(),
        })
        .unwrap();
        let reply: LookupReply = wire::decode(&service.dispatch(&raw).await).unwrap();
        let LookupReply::Ok { entry: found } = reply else {
            panic!("expected lookup hit");
        };
        assert_eq!(found.request_endpoint(), e.request_endpoint());

        let raw = wire::encode(&RegistryRequest::Deregister {
            name: e.name().clone(),
        })
        .unwrap();
        let reply: AckReply = wire::decode(&service.dispatch(&raw).await).unwrap();
        assert!(reply.is_ok());

        let raw = wire::encode(&RegistryRequest::Lookup {
            name: e.name().clone(),
        })
        .unwrap();
        let reply: LookupReply = wire::decode(&service.dispatch(&raw).await).unwrap();
        let LookupReply::Error { fault } = reply else {
            panic!("expected lookup miss");
        };
        assert_eq!(fault.kind, fault::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_rejects_garbage() {
        let service = service(29_503);
        let reply: AckReply = wire::decode(&service.dispatch(b"not msgpack").await).unwrap();
        let AckReply::Error { fault } = reply else {
            panic!("expected error reply");
        };
        assert_eq!(fault.kind, fault::BAD_REQUEST);
    }

    #[tokio::test]
    async fn served_round_trip_over_the_wire() {
        let bind = EndpointAddress::new("127.0.0.1", 29_505).unwrap();
        let service = service(bind.port());
        let shutdown = CancellationToken::new();
        let server = {
            let token = shutdown.clone();
            tokio::spawn(async move { service.run(token).await })
        };
        // Give the reply socket a moment to bind.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pool = EndpointPool::new();
        let client = pool
            .acquire(EndpointKind::Request, &bind, EndpointOptions::default())
            .await
            .unwrap();
        let raw = wire::encode(&RegistryRequest::Register {
            entry: entry("vision", 6300),
        })
        .unwrap();
        let reply = client.request(&raw).await.unwrap();
        let reply: AckReply = wire::decode(&reply).unwrap();
        assert!(reply.is_ok());

        pool.release(client).await.unwrap();
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
