//! Rate-limited error publication to the fabric error bus.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabric_net::wire;
use fabric_net::{EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress, ErrorEvent, MachineId, Severity};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Token bucket capacity per `(category, severity)`.
const BUCKET_CAPACITY: f64 = 20.0;
/// Interval over which one bucket refills completely.
const BUCKET_WINDOW: Duration = Duration::from_secs(5);
/// Timeout applied to each bus publish so the worker never wedges.
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

struct TokenBucket {
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_CAPACITY,
            last_refill: tokio::time::Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let refill = elapsed.as_secs_f64() / BUCKET_WINDOW.as_secs_f64() * BUCKET_CAPACITY;
        self.tokens = (self.tokens + refill).min(BUCKET_CAPACITY);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ReporterInner {
    agent: AgentName,
    machine: MachineId,
    sequence: AtomicU64,
    dropped: Arc<AtomicU64>,
    buckets: Mutex<HashMap<(String, Severity), TokenBucket>>,
    queue: mpsc::Sender<ErrorEvent>,
}

/// Handle agents use to publish [`ErrorEvent`]s.
///
/// Publication never blocks the caller: events pass through a per-category
/// token bucket, then a bounded queue drained by a background worker that
/// owns the publish endpoint. Shed events increment a local drop counter
/// that feeds the `self` health check.
#[derive(Clone)]
pub struct ErrorReporter {
    inner: Arc<ReporterInner>,
}

impl ErrorReporter {
    /// Creates a reporter and its publisher worker.
    ///
    /// When `bus` is `None`, events are logged locally and the worker only
    /// drains the queue.
    #[must_use]
    pub fn spawn(
        pool: EndpointPool,
        bus: Option<EndpointAddress>,
        agent: AgentName,
        machine: MachineId,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let reporter = Self {
            inner: Arc::new(ReporterInner {
                agent,
                machine,
                sequence: AtomicU64::new(0),
                dropped: Arc::clone(&dropped),
                buckets: Mutex::new(HashMap::new()),
                queue: tx,
            }),
        };
        let worker = tokio::spawn(async move {
            run_publisher(pool, bus, rx, dropped).await;
        });
        (reporter, worker)
    }

    /// Enqueues an error event for publication.
    ///
    /// Returns `true` when the event was accepted; rate-limited or shed
    /// events return `false` and bump the drop counter.
    pub fn publish(
        &self,
        severity: Severity,
        category: &str,
        message: impl Into<String>,
        context: Option<BTreeMap<String, String>>,
    ) -> bool {
        if !self.admit(category, severity) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let event = (|| {
            let mut builder =
                ErrorEvent::builder(self.inner.agent.clone(), self.inner.machine.clone(), severity)
                    .category(category)?
                    .message(message)?
                    .event_id(sequence);
            if let Some(context) = context {
                for (key, value) in context {
                    builder = builder.context_entry(key, value)?;
                }
            }
            builder.build()
        })();
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, category, "unpublishable error event");
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match self.inner.queue.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Returns how many events were shed locally.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn admit(&self, category: &str, severity: Severity) -> bool {
        let mut buckets = self.inner.buckets.lock().expect("bucket lock");
        buckets
            .entry((category.to_string(), severity))
            .or_insert_with(TokenBucket::new)
            .allow()
    }
}

async fn run_publisher(
    pool: EndpointPool,
    bus: Option<EndpointAddress>,
    mut rx: mpsc::Receiver<ErrorEvent>,
    dropped: Arc<AtomicU64>,
) {
    let handle = if let Some(address) = &bus {
        let options = EndpointOptions::default()
            .with_bind(false)
            .with_timeouts(PUBLISH_TIMEOUT);
        match pool
            .acquire(EndpointKind::Publish, address, options)
            .await
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "error bus unreachable; events will be logged only");
                None
            }
        }
    } else {
        None
    };

    while let Some(event) = rx.recv().await {
        debug!(
            severity = %event.severity(),
            category = event.category(),
            message = event.message(),
            "error event"
        );
        let Some(handle) = &handle else {
            continue;
        };
        let Ok(payload) = wire::encode(&event) else {
            dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if let Err(err) = handle.publish(&event.topic(), &payload).await {
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(error = %err, "error bus publish failed");
        }
    }

    if let Some(handle) = handle {
        if let Err(err) = pool.release(handle).await {
            debug!(error = %err, "error bus endpoint release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> (ErrorReporter, JoinHandle<()>) {
        ErrorReporter::spawn(
            EndpointPool::new(),
            None,
            AgentName::new("reporter-test").unwrap(),
            MachineId::new("testmachine").unwrap(),
            256,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_caps_one_category() {
        let (reporter, worker) = reporter();
        let mut accepted = 0;
        for i in 0..40 {
            if reporter.publish(
                Severity::Error,
                "network",
                format!("failure {i}"),
                None,
            ) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 20);
        assert_eq!(reporter.dropped(), 20);
        drop(reporter);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn categories_have_independent_buckets() {
        let (reporter, worker) = reporter();
        for i in 0..20 {
            assert!(reporter.publish(Severity::Error, "network", format!("a {i}"), None));
        }
        // network bucket is exhausted, resource is untouched.
        assert!(!reporter.publish(Severity::Error, "network", "over", None));
        assert!(reporter.publish(Severity::Error, "resource", "fresh", None));
        // Same category at a different severity is its own bucket too.
        assert!(reporter.publish(Severity::Warning, "network", "fresh", None));
        drop(reporter);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_the_window() {
        let (reporter, worker) = reporter();
        for i in 0..20 {
            assert!(reporter.publish(Severity::Info, "lifecycle", format!("{i}"), None));
        }
        assert!(!reporter.publish(Severity::Info, "lifecycle", "spent", None));

        tokio::time::advance(BUCKET_WINDOW).await;
        assert!(reporter.publish(Severity::Info, "lifecycle", "refilled", None));
        drop(reporter);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn context_rides_along() {
        let (reporter, worker) = reporter();
        let context = BTreeMap::from([("code".to_string(), "503".to_string())]);
        assert!(reporter.publish(Severity::Warning, "network", "upstream", Some(context)));
        drop(reporter);
        worker.await.unwrap();
    }
}
