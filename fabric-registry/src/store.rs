//! Redis-backed external store with TTL expiry.

use std::time::Duration;

use async_trait::async_trait;
use fabric_primitives::AgentName;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::backend::{BackendError, BackendResult, RegistryBackend};
use crate::entry::ServiceEntry;

/// Registry backend over a Redis-compatible store.
///
/// Entries are JSON documents under `<namespace>:agent:<name>` with a TTL
/// stamped at `register` and re-armed by each `heartbeat`; expiry is the
/// store's own clock, the registry never scans. A reverse index
/// `<namespace>:endpoint:<host>:<port>` claimed with `SET NX` detects two
/// distinct owners contending for one request endpoint.
pub struct RedisBackend {
    manager: ConnectionManager,
    namespace: String,
    ttl: Duration,
}

impl RedisBackend {
    /// Connects to the store at `url`, e.g. `redis://10.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] when the initial connection
    /// fails.
    pub async fn connect(url: &str, namespace: impl Into<String>, ttl: Duration) -> BackendResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let manager = ConnectionManager::new(client).await.map_err(map_redis_err)?;
        Ok(Self {
            manager,
            namespace: namespace.into(),
            ttl,
        })
    }

    fn entry_key(&self, name: &AgentName) -> String {
        format!("{}:agent:{}", self.namespace, name)
    }

    fn index_key(&self, entry: &ServiceEntry) -> String {
        format!(
            "{}:endpoint:{}:{}",
            self.namespace,
            entry.request_endpoint().host(),
            entry.request_endpoint().port()
        )
    }

    fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn claim_endpoint(&self, entry: &ServiceEntry) -> BackendResult<()> {
        let mut con = self.manager.clone();
        let index = self.index_key(entry);
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&index)
            .arg(entry.name().as_str())
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if claimed.is_some() {
            return Ok(());
        }
        let owner: Option<String> = redis::cmd("GET")
            .arg(&index)
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        match owner {
            Some(owner) if owner == entry.name().as_str() => {
                // Same owner re-registering; re-arm the claim.
                let () = redis::cmd("SET")
                    .arg(&index)
                    .arg(entry.name().as_str())
                    .arg("EX")
                    .arg(self.ttl_seconds())
                    .query_async(&mut con)
                    .await
                    .map_err(map_redis_err)?;
                Ok(())
            }
            Some(owner) => Err(BackendError::Conflict {
                endpoint: entry.request_endpoint().to_string(),
                owner,
            }),
            // Claim expired between SET NX and GET; retry once.
            None => {
                let () = redis::cmd("SET")
                    .arg(&index)
                    .arg(entry.name().as_str())
                    .arg("EX")
                    .arg(self.ttl_seconds())
                    .query_async(&mut con)
                    .await
                    .map_err(map_redis_err)?;
                Ok(())
            }
        }
    }

    async fn drop_stale_index(&self, entry: &ServiceEntry) -> BackendResult<()> {
        let mut con = self.manager.clone();
        let previous: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(entry.name()))
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if let Some(raw) = previous
            && let Ok(old) = serde_json::from_str::<ServiceEntry>(&raw)
            && old.request_endpoint() != entry.request_endpoint()
        {
            let () = redis::cmd("DEL")
                .arg(self.index_key(&old))
                .query_async(&mut con)
                .await
                .map_err(map_redis_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryBackend for RedisBackend {
    async fn register(&self, mut entry: ServiceEntry) -> BackendResult<()> {
        self.drop_stale_index(&entry).await?;
        self.claim_endpoint(&entry).await?;
        entry.touch();
        let document = serde_json::to_string(&entry).map_err(|e| BackendError::InvalidEntry {
            reason: e.to_string(),
        })?;
        let mut con = self.manager.clone();
        let () = redis::cmd("SET")
            .arg(self.entry_key(entry.name()))
            .arg(document)
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        debug!(agent = %entry.name(), ttl = self.ttl_seconds(), "entry stored");
        Ok(())
    }

    async fn deregister(&self, name: &AgentName) -> BackendResult<()> {
        let mut con = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(name))
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if let Some(raw) = raw
            && let Ok(entry) = serde_json::from_str::<ServiceEntry>(&raw)
        {
            let () = redis::cmd("DEL")
                .arg(self.index_key(&entry))
                .query_async(&mut con)
                .await
                .map_err(map_redis_err)?;
        }
        let () = redis::cmd("DEL")
            .arg(self.entry_key(name))
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn lookup(&self, name: &AgentName) -> BackendResult<ServiceEntry> {
        let mut con = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(name))
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        let raw = raw.ok_or_else(|| BackendError::NotFound {
            name: name.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| BackendError::Backend {
            detail: format!("corrupt entry for `{name}`: {e}"),
        })
    }

    async fn list(&self, capability: Option<&str>) -> BackendResult<Vec<ServiceEntry>> {
        let mut con = self.manager.clone();
        let pattern = format!("{}:agent:*", self.namespace);
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut command = redis::cmd("MGET");
        for key in &keys {
            command.arg(key);
        }
        let documents: Vec<Option<String>> =
            command.query_async(&mut con).await.map_err(map_redis_err)?;
        let mut entries: Vec<ServiceEntry> = documents
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str::<ServiceEntry>(&raw).ok())
            .filter(|entry| capability.is_none_or(|tag| entry.has_capability(tag)))
            .collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    async fn heartbeat(&self, name: &AgentName) -> BackendResult<()> {
        let mut con = self.manager.clone();
        let refreshed: i64 = redis::cmd("EXPIRE")
            .arg(self.entry_key(name))
            .arg(self.ttl_seconds())
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if refreshed == 0 {
            // Entry expired; the owner must register again.
            return Err(BackendError::NotFound {
                name: name.to_string(),
            });
        }
        // Keep the endpoint claim alive for as long as the entry.
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(name))
            .query_async(&mut con)
            .await
            .map_err(map_redis_err)?;
        if let Some(raw) = raw
            && let Ok(entry) = serde_json::from_str::<ServiceEntry>(&raw)
        {
            let () = redis::cmd("EXPIRE")
                .arg(self.index_key(&entry))
                .arg(self.ttl_seconds())
                .query_async(&mut con)
                .await
                .map_err(map_redis_err)?;
        }
        Ok(())
    }
}

fn map_redis_err(err: redis::RedisError) -> BackendError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        BackendError::Unavailable {
            detail: err.to_string(),
        }
    } else {
        BackendError::Backend {
            detail: err.to_string(),
        }
    }
}
