//! In-memory registry backend.

use std::collections::HashMap;

use async_trait::async_trait;
use fabric_primitives::AgentName;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{BackendError, BackendResult, RegistryBackend};
use crate::entry::ServiceEntry;

/// Map-backed registry for single-machine deployments and tests.
///
/// Entries never expire; `heartbeat` is a successful no-op. A single writer
/// mutates the map while lookups take shared read locks.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<AgentName, ServiceEntry>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for InMemoryBackend {
    async fn register(&self, mut entry: ServiceEntry) -> BackendResult<()> {
        let mut entries = self.entries.write().await;
        let claim = entry.request_endpoint();
        if let Some(owner) = entries.values().find(|existing| {
            existing.name() != entry.name() && existing.request_endpoint() == claim
        }) {
            return Err(BackendError::Conflict {
                endpoint: claim.to_string(),
                owner: owner.name().to_string(),
            });
        }
        entry.touch();
        debug!(agent = %entry.name(), endpoint = %entry.request_endpoint(), "entry registered");
        entries.insert(entry.name().clone(), entry);
        Ok(())
    }

    async fn deregister(&self, name: &AgentName) -> BackendResult<()> {
        let removed = self.entries.write().await.remove(name).is_some();
        if removed {
            debug!(agent = %name, "entry deregistered");
        }
        Ok(())
    }

    async fn lookup(&self, name: &AgentName) -> BackendResult<ServiceEntry> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self, capability: Option<&str>) -> BackendResult<Vec<ServiceEntry>> {
        let entries = self.entries.read().await;
        let mut matching: Vec<ServiceEntry> = entries
            .values()
            .filter(|entry| capability.is_none_or(|tag| entry.has_capability(tag)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(matching)
    }

    async fn heartbeat(&self, _name: &AgentName) -> BackendResult<()> {
        Ok(())
    }
}
