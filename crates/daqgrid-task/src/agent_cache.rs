//! Per-agent attribute cache.
//!
//! Informational only: authoritative agent state is re-issued by the
//! outer manager on every offer. Entries are refreshed on every accepted
//! offer and evicted when the outer manager reports an agent failure.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use daq_core::{AgentId, Attributes};

/// What the cache knows about one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCacheEntry {
    pub agent_id: AgentId,
    pub hostname: String,
    pub attributes: Attributes,
    /// Unix timestamp of the offer that last refreshed this entry.
    pub last_seen: u64,
}

/// Concurrent agent-id → entry map. Update is last-write-wins; lookup is
/// non-blocking.
#[derive(Default)]
pub struct AgentCache {
    inner: RwLock<HashMap<AgentId, AgentCacheEntry>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, agent_id: &str, hostname: &str, attributes: Attributes) {
        let entry = AgentCacheEntry {
            agent_id: agent_id.to_string(),
            hostname: hostname.to_string(),
            attributes,
            last_seen: epoch_secs(),
        };
        let mut map = self.inner.write().expect("agent cache lock poisoned");
        map.insert(entry.agent_id.clone(), entry);
    }

    pub fn lookup(&self, agent_id: &str) -> Option<AgentCacheEntry> {
        let map = self.inner.read().expect("agent cache lock poisoned");
        map.get(agent_id).cloned()
    }

    /// Drop an agent after an outer-manager failure event.
    pub fn evict(&self, agent_id: &str) -> bool {
        let mut map = self.inner.write().expect("agent cache lock poisoned");
        map.remove(agent_id).is_some()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().expect("agent cache lock poisoned");
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
