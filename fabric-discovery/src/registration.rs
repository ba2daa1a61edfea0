//! Background registration and heartbeat maintenance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fabric_registry::ServiceEntry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::client::{DiscoveryClient, DiscoveryError};

/// Consecutive heartbeat failures tolerated before re-registering.
const MAX_HEARTBEAT_FAILURES: usize = 3;

/// Every this many successful heartbeats, confirm the entry still exists.
///
/// Heartbeats only refresh TTLs, so a registry that lost its state (a
/// restart of the in-memory backend, a flushed store) can keep answering
/// them; the periodic lookup catches that and re-registers.
const VERIFY_EVERY: u64 = 6;

/// Delay bounds for re-registration attempts after the backend lost us.
const REREGISTER_BASE: Duration = Duration::from_secs(1);
const REREGISTER_CAP: Duration = Duration::from_secs(30);

/// Live registration owned by one agent process.
///
/// When constructed with a refresh interval, a worker task heartbeats the
/// entry so TTL-based backends keep it alive, and re-registers when the
/// backend reports the entry gone. [`Registration::stop`] shuts the worker
/// down and deregisters.
pub struct Registration {
    client: DiscoveryClient,
    entry: ServiceEntry,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Registration {
    pub(crate) fn start(
        client: DiscoveryClient,
        entry: ServiceEntry,
        refresh_interval: Option<Duration>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = refresh_interval.map(|interval| {
            let client = client.clone();
            let entry = entry.clone();
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                run_refresh_loop(client, entry, shutdown, interval).await;
            })
        });
        Self {
            client,
            entry,
            shutdown,
            worker,
        }
    }

    /// Returns the registered entry.
    #[must_use]
    pub const fn entry(&self) -> &ServiceEntry {
        &self.entry
    }

    /// Stops the heartbeat worker and deregisters the entry.
    ///
    /// # Errors
    ///
    /// Returns the deregistration failure, after the worker has already been
    /// stopped.
    pub async fn stop(mut self) -> Result<(), DiscoveryError> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        let result = self.client.deregister(self.entry.name()).await;
        if result.is_ok() {
            info!(agent = %self.entry.name(), "deregistered");
        }
        result
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn run_refresh_loop(
    client: DiscoveryClient,
    entry: ServiceEntry,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: usize = 0;
    let mut beats: u64 = 0;

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        match client.heartbeat_once(entry.name()).await {
            Ok(()) => {
                failures = 0;
                beats += 1;
                if beats % VERIFY_EVERY == 0 && !still_registered(&client, &entry).await {
                    warn!(agent = %entry.name(), "registry lost our entry; re-registering");
                    reregister(&client, &entry, &shutdown).await;
                }
            }
            Err(DiscoveryError::NotFound { .. }) => {
                // TTL expired server-side; claim the entry again.
                warn!(agent = %entry.name(), "registry lost our entry; re-registering");
                reregister(&client, &entry, &shutdown).await;
                failures = 0;
            }
            Err(err) => {
                failures += 1;
                warn!(agent = %entry.name(), ?err, failures, "heartbeat failure");
                if failures >= MAX_HEARTBEAT_FAILURES {
                    warn!(
                        agent = %entry.name(),
                        failures,
                        "heartbeat failure threshold reached; attempting re-registration"
                    );
                    reregister(&client, &entry, &shutdown).await;
                    failures = 0;
                }
            }
        }
    }
}

/// Confirms the registry still holds this process's entry.
///
/// Bypasses the lookup cache, since the cached copy is exactly what could
/// be stale. A lookup owned by a different instance means another process
/// took the name; that is reported, not fought over.
async fn still_registered(client: &DiscoveryClient, entry: &ServiceEntry) -> bool {
    client.invalidate(entry.name());
    match client.lookup(entry.name()).await {
        Ok(found) => {
            if found.instance() == entry.instance() {
                true
            } else {
                warn!(
                    agent = %entry.name(),
                    theirs = %found.instance(),
                    ours = %entry.instance(),
                    "registry entry owned by another instance; leaving it"
                );
                true
            }
        }
        Err(DiscoveryError::NotFound { .. }) => false,
        // Unreachable registry is the heartbeat path's problem.
        Err(_) => true,
    }
}

async fn reregister(client: &DiscoveryClient, entry: &ServiceEntry, shutdown: &AtomicBool) {
    let mut delay = REREGISTER_BASE;
    while !shutdown.load(Ordering::Acquire) {
        match client.register_once(entry).await {
            Ok(()) => {
                info!(agent = %entry.name(), "re-registered with registry");
                return;
            }
            Err(err) => {
                warn!(agent = %entry.name(), ?err, "re-registration failed; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(REREGISTER_CAP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fabric_net::EndpointPool;
    use fabric_primitives::{AgentName, EndpointAddress, InstanceId, MachineId};
    use fabric_registry::{InMemoryBackend, RegistryService, RegistryServiceConfig};
    use tokio_util::sync::CancellationToken;

    use crate::client::{DiscoveryClient, DiscoveryConfig, RetryPolicy};

    fn entry(name: &str, port: u16) -> ServiceEntry {
        ServiceEntry::new(
            AgentName::new(name).unwrap(),
            InstanceId::random(),
            EndpointAddress::new("127.0.0.1", port).unwrap(),
            EndpointAddress::new("127.0.0.1", port + 1).unwrap(),
        )
    }

    fn spawn_registry(port: u16) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let service = RegistryService::new(
            Arc::new(InMemoryBackend::new()),
            RegistryServiceConfig {
                bind: EndpointAddress::new("127.0.0.1", port).unwrap(),
                machine: MachineId::new("testmachine").unwrap(),
                error_bus: None,
            },
        );
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            service.run(token).await.expect("registry run");
        });
        (shutdown, handle)
    }

    fn client_for(port: u16) -> DiscoveryClient {
        let config = DiscoveryConfig::new(EndpointAddress::new("127.0.0.1", port).unwrap());
        DiscoveryClient::new(EndpointPool::new(), config)
    }

    #[tokio::test]
    async fn register_self_then_peers_can_look_us_up() {
        let port = 29_511;
        let (shutdown, server) = spawn_registry(port);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = client_for(port);
        let registration = client
            .register_self(entry("asr", 6100), None)
            .await
            .expect("register");

        let found = client
            .lookup(&AgentName::new("asr").unwrap())
            .await
            .expect("lookup");
        assert_eq!(found.request_endpoint().port(), 6100);

        registration.stop().await.expect("stop");
        let err = {
            client.invalidate(&AgentName::new("asr").unwrap());
            client
                .lookup(&AgentName::new("asr").unwrap())
                .await
                .expect_err("gone")
        };
        assert!(matches!(err, DiscoveryError::NotFound { .. }));

        shutdown.cancel();
        server.await.expect("join");
    }

    #[tokio::test]
    async fn negative_cache_skips_registry() {
        let port = 29_513;
        let (shutdown, server) = spawn_registry(port);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = client_for(port);
        let ghost = AgentName::new("ghost").unwrap();
        let first = client.lookup(&ghost).await.expect_err("absent");
        assert!(matches!(first, DiscoveryError::NotFound { .. }));

        // Stop the registry; the cached miss must still answer.
        shutdown.cancel();
        server.await.expect("join");
        let second = client.lookup(&ghost).await.expect_err("cached miss");
        assert!(matches!(second, DiscoveryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unreachable_registry_reports_unavailable() {
        // Nothing listens on this port; keep the schedule short.
        let mut config =
            DiscoveryConfig::new(EndpointAddress::new("127.0.0.1", 29_515).unwrap());
        config.lookup_timeout = Duration::from_millis(100);
        config.retry = RetryPolicy {
            base: Duration::from_millis(10),
            factor: 2,
            cap: Duration::from_millis(40),
            attempts: 3,
        };
        let client = DiscoveryClient::new(EndpointPool::new(), config);
        let err = client
            .lookup(&AgentName::new("anyone").unwrap())
            .await
            .expect_err("unreachable");
        assert!(matches!(err, DiscoveryError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn refresh_worker_restores_entry_the_registry_lost() {
        let port = 29_517;
        let (shutdown, server) = spawn_registry(port);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = client_for(port);
        let name = AgentName::new("tts").unwrap();
        let registration = client
            .register_self(entry("tts", 6200), Some(Duration::from_millis(40)))
            .await
            .expect("register");

        // Drop the entry behind the worker's back. In-memory heartbeats
        // still ack, so only the periodic self-verification can notice.
        client.deregister(&name).await.expect("deregister");
        client.invalidate(&name);
        assert!(matches!(
            client.lookup(&name).await,
            Err(DiscoveryError::NotFound { .. })
        ));

        // Wait past a verification boundary for the worker to re-register.
        let mut restored = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.invalidate(&name);
            if client.lookup(&name).await.is_ok() {
                restored = true;
                break;
            }
        }
        assert!(restored, "worker should have re-registered the entry");

        registration.stop().await.expect("stop");
        shutdown.cancel();
        server.await.expect("join");
    }
}
