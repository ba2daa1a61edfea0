//! Cached, retrying client for the registry endpoint.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fabric_net::wire::{self, fault};
use fabric_net::{EndpointError, EndpointHandle, EndpointKind, EndpointOptions, EndpointPool};
use fabric_primitives::{AgentName, EndpointAddress};
use fabric_registry::ServiceEntry;
use fabric_registry::protocol::{AckReply, ListReply, LookupReply, RegistryRequest};
use lru::LruCache;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registration::Registration;

/// Metadata key under which agents advertise their publish endpoint.
pub(crate) const PUBLISH_ENDPOINT_KEY: &str = "publish_endpoint";

/// Backoff schedule for retrying transient registry failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// First retry delay.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Upper bound on a single delay.
    pub cap: Duration,
    /// Total attempts before giving up.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_secs(2),
            attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before attempt `n` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Address of the registry's reply endpoint.
    pub registry: EndpointAddress,
    /// Budget for one lookup exchange.
    pub lookup_timeout: Duration,
    /// How long a successful lookup stays cached.
    pub positive_ttl: Duration,
    /// How long a `NotFound` stays cached.
    pub negative_ttl: Duration,
    /// Bound on cached names.
    pub cache_capacity: NonZeroUsize,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl DiscoveryConfig {
    /// Returns defaults for a registry at the given address.
    #[must_use]
    pub fn new(registry: EndpointAddress) -> Self {
        Self {
            registry,
            lookup_timeout: Duration::from_secs(1),
            positive_ttl: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(2),
            cache_capacity: NonZeroUsize::new(4096).expect("non-zero"),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors surfaced to agents by the discovery client.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The registry could not be reached after retries.
    #[error("registry unavailable: {detail}")]
    Unavailable {
        /// Last observed failure.
        detail: String,
    },
    /// The name has no registry entry. Not retried.
    #[error("agent `{name}` not found")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },
    /// The registry answered with a non-retryable error.
    #[error("registry rejected request: {kind}: {message}")]
    Rejected {
        /// Wire error kind token.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// The agent exists but advertises no publish endpoint.
    #[error("agent `{name}` does not advertise a publish endpoint")]
    NoPublishEndpoint {
        /// The agent in question.
        name: String,
    },
    /// A local endpoint operation failed outside the retry path.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

enum CacheSlot {
    Hit { entry: ServiceEntry, at: Instant },
    Miss { at: Instant },
}

struct Inner {
    config: DiscoveryConfig,
    pool: EndpointPool,
    cache: RwLock<LruCache<AgentName, CacheSlot>>,
}

/// Shared registry client; clones are cheap and share one cache.
///
/// All operations are safe to call from any task. Cache reads take a shared
/// lock and never reorder the LRU list; only inserts take the write lock.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<Inner>,
}

impl DiscoveryClient {
    /// Creates a client over the process's endpoint pool.
    #[must_use]
    pub fn new(pool: EndpointPool, config: DiscoveryConfig) -> Self {
        let cache = RwLock::new(LruCache::new(config.cache_capacity));
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                cache,
            }),
        }
    }

    /// Returns the configured registry address.
    #[must_use]
    pub fn registry(&self) -> &EndpointAddress {
        &self.inner.config.registry
    }

    /// Looks up an agent's entry, consulting the cache first.
    ///
    /// Transient transport failures retry on the configured backoff
    /// schedule; `NotFound` is cached briefly and never retried.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] for missing names and
    /// [`DiscoveryError::Unavailable`] once retries are exhausted.
    pub async fn lookup(&self, name: &AgentName) -> DiscoveryResult<ServiceEntry> {
        if let Some(result) = self.cached(name) {
            return result;
        }

        let request = RegistryRequest::Lookup { name: name.clone() };
        let reply = self.exchange_with_retry(&request).await?;
        match wire::decode::<LookupReply>(&reply) {
            Ok(LookupReply::Ok { entry }) => {
                self.store(name.clone(), CacheSlot::Hit {
                    entry: entry.clone(),
                    at: Instant::now(),
                });
                Ok(entry)
            }
            Ok(LookupReply::Error { fault: body }) if body.kind == fault::NOT_FOUND => {
                self.store(name.clone(), CacheSlot::Miss { at: Instant::now() });
                Err(DiscoveryError::NotFound {
                    name: name.to_string(),
                })
            }
            Ok(LookupReply::Error { fault: body }) => Err(DiscoveryError::Rejected {
                kind: body.kind,
                message: body.message,
            }),
            Err(err) => Err(DiscoveryError::Unavailable {
                detail: format!("undecodable reply: {err}"),
            }),
        }
    }

    /// Returns a pooled request endpoint connected to the named agent,
    /// ready to send to.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures and endpoint creation errors.
    pub async fn resolve(&self, name: &AgentName) -> DiscoveryResult<EndpointHandle> {
        let entry = self.lookup(name).await?;
        let handle = self
            .inner
            .pool
            .acquire(
                EndpointKind::Request,
                entry.request_endpoint(),
                EndpointOptions::default(),
            )
            .await?;
        Ok(handle)
    }

    /// Returns a subscribe endpoint connected to the named agent's publish
    /// endpoint, filtered to `topic_prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoPublishEndpoint`] when the entry does not
    /// advertise one, alongside the usual lookup failures.
    pub async fn subscribe_to(
        &self,
        name: &AgentName,
        topic_prefix: &str,
    ) -> DiscoveryResult<EndpointHandle> {
        let entry = self.lookup(name).await?;
        let advertised = entry
            .metadata()
            .get(PUBLISH_ENDPOINT_KEY)
            .ok_or_else(|| DiscoveryError::NoPublishEndpoint {
                name: name.to_string(),
            })?;
        let address: EndpointAddress =
            advertised
                .parse()
                .map_err(|_| DiscoveryError::NoPublishEndpoint {
                    name: name.to_string(),
                })?;
        let handle = self
            .inner
            .pool
            .acquire(
                EndpointKind::Subscribe,
                &address,
                EndpointOptions::default(),
            )
            .await?;
        handle.subscribe(topic_prefix).await?;
        Ok(handle)
    }

    /// Drops any cached lookup for the name.
    pub fn invalidate(&self, name: &AgentName) {
        let mut cache = self.inner.cache.write().expect("cache lock");
        cache.pop(name);
    }

    /// Registers this process's entry and optionally keeps it fresh.
    ///
    /// With a `refresh_interval`, a background worker heartbeats the entry
    /// and re-registers when the backend reports it expired. Stop the
    /// returned [`Registration`] during shutdown to deregister cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] when the initial registration
    /// exhausts its retries, or a rejection from the registry.
    pub async fn register_self(
        &self,
        entry: ServiceEntry,
        refresh_interval: Option<Duration>,
    ) -> DiscoveryResult<Registration> {
        self.register_once(&entry).await?;
        Ok(Registration::start(self.clone(), entry, refresh_interval))
    }

    /// Lists registry entries, optionally filtered by capability tag.
    /// Results are not cached.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] after exhausted retries or a
    /// rejection from the registry.
    pub async fn list(&self, capability: Option<&str>) -> DiscoveryResult<Vec<ServiceEntry>> {
        let request = RegistryRequest::List {
            capability: capability.map(str::to_string),
        };
        let reply = self.exchange_with_retry(&request).await?;
        match wire::decode::<ListReply>(&reply) {
            Ok(ListReply::Ok { entries }) => Ok(entries),
            Ok(ListReply::Error { fault: body }) => Err(DiscoveryError::Rejected {
                kind: body.kind,
                message: body.message,
            }),
            Err(err) => Err(DiscoveryError::Unavailable {
                detail: format!("undecodable reply: {err}"),
            }),
        }
    }

    /// One registration attempt cycle with the standard retry schedule.
    pub(crate) async fn register_once(&self, entry: &ServiceEntry) -> DiscoveryResult<()> {
        let request = RegistryRequest::Register {
            entry: entry.clone(),
        };
        let reply = self.exchange_with_retry(&request).await?;
        ack(&reply)
    }

    /// Sends one heartbeat without retry; the worker owns the cadence.
    pub(crate) async fn heartbeat_once(&self, name: &AgentName) -> DiscoveryResult<()> {
        let request = RegistryRequest::Heartbeat { name: name.clone() };
        let reply = self.exchange(&request).await.map_err(|detail| {
            DiscoveryError::Unavailable {
                detail,
            }
        })?;
        ack(&reply)
    }

    /// Removes this process's entry. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] after exhausted retries.
    pub async fn deregister(&self, name: &AgentName) -> DiscoveryResult<()> {
        let request = RegistryRequest::Deregister { name: name.clone() };
        let reply = self.exchange_with_retry(&request).await?;
        self.invalidate(name);
        ack(&reply)
    }

    fn cached(&self, name: &AgentName) -> Option<DiscoveryResult<ServiceEntry>> {
        let cache = self.inner.cache.read().expect("cache lock");
        match cache.peek(name)? {
            CacheSlot::Hit { entry, at } if at.elapsed() < self.inner.config.positive_ttl => {
                Some(Ok(entry.clone()))
            }
            CacheSlot::Miss { at } if at.elapsed() < self.inner.config.negative_ttl => {
                Some(Err(DiscoveryError::NotFound {
                    name: name.to_string(),
                }))
            }
            _ => None,
        }
    }

    fn store(&self, name: AgentName, slot: CacheSlot) {
        let mut cache = self.inner.cache.write().expect("cache lock");
        cache.put(name, slot);
    }

    /// One request/reply exchange against the registry. The pooled request
    /// endpoint is discarded after a timeout, since a half-completed REQ
    /// exchange cannot be reused.
    async fn exchange(&self, request: &RegistryRequest) -> Result<Vec<u8>, String> {
        let payload = wire::encode(request).map_err(|e| e.to_string())?;
        let options = EndpointOptions::default().with_timeouts(self.inner.config.lookup_timeout);
        let handle = self
            .inner
            .pool
            .acquire(EndpointKind::Request, &self.inner.config.registry, options)
            .await
            .map_err(|e| e.to_string())?;
        match handle.request(&payload).await {
            Ok(reply) => {
                if let Err(err) = self.inner.pool.release(handle).await {
                    debug!(error = %err, "registry endpoint release failed");
                }
                Ok(reply.to_vec())
            }
            Err(err) => {
                self.inner.pool.discard(handle).await;
                Err(err.to_string())
            }
        }
    }

    async fn exchange_with_retry(&self, request: &RegistryRequest) -> DiscoveryResult<Vec<u8>> {
        let retry = self.inner.config.retry;
        let mut last_failure = String::new();
        for attempt in 0..retry.attempts {
            if attempt > 0 {
                let delay = retry.delay(attempt - 1);
                debug!(attempt, ?delay, "retrying registry exchange");
                tokio::time::sleep(delay).await;
            }
            match self.exchange(request).await {
                Ok(reply) => return Ok(reply),
                Err(detail) => {
                    warn!(attempt, detail = %detail, "registry exchange failed");
                    last_failure = detail;
                }
            }
        }
        Err(DiscoveryError::Unavailable {
            detail: last_failure,
        })
    }
}

fn ack(reply: &[u8]) -> DiscoveryResult<()> {
    match wire::decode::<AckReply>(reply) {
        Ok(AckReply::Ok {}) => Ok(()),
        Ok(AckReply::Error { fault: body }) if body.kind == fault::NOT_FOUND => {
            Err(DiscoveryError::NotFound {
                name: body
                    .context
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| body.message.clone()),
            })
        }
        Ok(AckReply::Error { fault: body }) if body.kind == fault::UNAVAILABLE => {
            Err(DiscoveryError::Unavailable {
                detail: body.message,
            })
        }
        Ok(AckReply::Error { fault: body }) => Err(DiscoveryError::Rejected {
            kind: body.kind,
            message: body.message,
        }),
        Err(err) => Err(DiscoveryError::Unavailable {
            detail: format!("undecodable reply: {err}"),
        }),
    }
}
