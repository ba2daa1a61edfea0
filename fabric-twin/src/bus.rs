//! The cross-machine error bus broker.

use std::collections::VecDeque;
use std::time::Duration;

use fabric_net::wire;
use fabric_net::{EndpointError, EndpointKind, EndpointOptions, EndpointPool, Published};
use fabric_primitives::{AgentName, EndpointAddress, ErrorEvent, MachineId, Severity, topic};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the broker summarises shed events.
const DROP_SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
/// Receive slice, so the shutdown token is observed promptly.
const IDLE_RECV: Duration = Duration::from_millis(100);

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct ErrorBusConfig {
    /// Address publishers connect their publish endpoints to (broker binds
    /// the subscribe side here).
    pub frontend: EndpointAddress,
    /// Address subscribers connect to (broker binds the publish side here).
    pub backend: EndpointAddress,
    /// Queue depth per forwarding hop before old events are shed.
    pub high_water_mark: usize,
    /// Machine stamped on the broker's own summary events.
    pub machine: MachineId,
}

/// Rendezvous broker between publishers and subscribers.
///
/// Publishers connect publish endpoints to the frontend; the broker
/// re-broadcasts every event on the backend, preserving per-publisher
/// order. Delivery is best effort: when the forwarding queue reaches the
/// high-water mark, the oldest events are shed rather than blocking
/// publishers, and a warning summarising the shed count is broadcast every
/// ten seconds.
pub struct ErrorBus {
    config: ErrorBusConfig,
    pool: EndpointPool,
    name: AgentName,
}

impl ErrorBus {
    /// Creates a broker with its own endpoint pool.
    #[must_use]
    pub fn new(config: ErrorBusConfig) -> Self {
        Self {
            config,
            pool: EndpointPool::new(),
            name: AgentName::new("error-bus").expect("static name is valid"),
        }
    }

    /// Runs the proxy loop until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointError`] when either side cannot be bound.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EndpointError> {
        let frontend = self
            .pool
            .acquire(
                EndpointKind::Subscribe,
                &self.config.frontend,
                EndpointOptions::default().with_bind(true),
            )
            .await?;
        frontend.subscribe("").await?;
        info!(frontend = %self.config.frontend, "bus frontend bound; publishers connect here");

        let backend = self
            .pool
            .acquire(
                EndpointKind::Publish,
                &self.config.backend,
                EndpointOptions::default().with_timeouts(Duration::from_millis(500)),
            )
            .await?;
        info!(backend = %self.config.backend, "bus backend bound; subscribers connect here");

        let mut queue: VecDeque<Published> = VecDeque::new();
        let mut forwarded: u64 = 0;
        let mut dropped_since_summary: u64 = 0;
        let mut summary_due = tokio::time::Instant::now() + DROP_SUMMARY_INTERVAL;

        while !shutdown.is_cancelled() {
            match tokio::time::timeout(IDLE_RECV, frontend.next_published()).await {
                Ok(Ok(message)) => {
                    queue.push_back(message);
                    while queue.len() > self.config.high_water_mark {
                        queue.pop_front();
                        dropped_since_summary += 1;
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "frontend receive failed");
                }
                Err(_) => {}
            }

            while let Some(message) = queue.front() {
                match backend.publish(&message.topic, &message.payload).await {
                    Ok(()) => {
                        forwarded += 1;
                        debug!(topic = %message.topic, forwarded, "forwarded");
                        queue.pop_front();
                    }
                    Err(err) => {
                        debug!(error = %err, "backend send stalled");
                        break;
                    }
                }
            }

            if tokio::time::Instant::now() >= summary_due {
                if dropped_since_summary > 0 {
                    self.broadcast_drop_summary(&backend, dropped_since_summary)
                        .await;
                    dropped_since_summary = 0;
                }
                summary_due = tokio::time::Instant::now() + DROP_SUMMARY_INTERVAL;
            }
        }

        self.pool.release(frontend).await?;
        self.pool.release(backend).await?;
        self.pool.close_all().await;
        info!(forwarded, "bus stopped");
        Ok(())
    }

    /// Broadcasts a warning summarising events shed since the last summary.
    async fn broadcast_drop_summary(&self, backend: &fabric_net::EndpointHandle, count: u64) {
        warn!(dropped = count, "bus shed events at the high-water mark");
        let event = ErrorEvent::builder(
            self.name.clone(),
            self.config.machine.clone(),
            Severity::Warning,
        )
        .category("backpressure")
        .and_then(|b| b.message(format!("shed {count} events at high-water mark")))
        .and_then(|b| b.build());
        let Ok(event) = event else {
            return;
        };
        let Ok(payload) = wire::encode(&event) else {
            return;
        };
        if let Err(err) = backend.publish(&event.topic(), &payload).await {
            debug!(error = %err, "drop summary publish failed");
        }
    }
}

/// Convenience for subscribers: the prefix matching every bus event.
#[must_use]
pub fn all_events_prefix() -> &'static str {
    topic::ALL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frontend: u16, backend: u16) -> ErrorBusConfig {
        ErrorBusConfig {
            frontend: EndpointAddress::new("127.0.0.1", frontend).unwrap(),
            backend: EndpointAddress::new("127.0.0.1", backend).unwrap(),
            high_water_mark: 1000,
            machine: MachineId::new("testmachine").unwrap(),
        }
    }

    fn event(agent: &str, id: u64) -> ErrorEvent {
        ErrorEvent::builder(
            AgentName::new(agent).unwrap(),
            MachineId::new("testmachine").unwrap(),
            Severity::Error,
        )
        .category("network")
        .unwrap()
        .message(format!("event {id}"))
        .unwrap()
        .event_id(id)
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn rebroadcasts_publisher_events_in_order() {
        let config = config(29_801, 29_802);
        let bus = ErrorBus::new(config.clone());
        let shutdown = CancellationToken::new();
        let broker = {
            let token = shutdown.clone();
            tokio::spawn(async move { bus.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let pool = EndpointPool::new();
        let subscriber = pool
            .acquire(
                EndpointKind::Subscribe,
                &config.backend,
                EndpointOptions::default(),
            )
            .await
            .expect("subscribe backend");
        subscriber.subscribe("err.").await.expect("filter");

        let publisher = pool
            .acquire(
                EndpointKind::Publish,
                &config.frontend,
                EndpointOptions::default().with_bind(false),
            )
            .await
            .expect("connect frontend");
        // Late-joiner settle time for the pub/sub pipeline.
        tokio::time::sleep(Duration::from_millis(200)).await;

        for id in 0..3 {
            let event = event("vision", id);
            let payload = wire::encode(&event).expect("encode");
            publisher
                .publish(&event.topic(), &payload)
                .await
                .expect("publish");
        }

        for expected in 0..3 {
            let received = tokio::time::timeout(Duration::from_secs(5), subscriber.next_published())
                .await
                .expect("event within deadline")
                .expect("receive");
            assert_eq!(received.topic, "err.error.testmachine.vision");
            let decoded: ErrorEvent = wire::decode(&received.payload).expect("decode");
            assert_eq!(decoded.event_id(), expected);
        }

        pool.release(subscriber).await.unwrap();
        pool.release(publisher).await.unwrap();
        shutdown.cancel();
        broker.await.expect("join").expect("bus run");
    }
}
