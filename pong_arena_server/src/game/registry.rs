use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::runtime::{MatchRuntime, RuntimeHandle};
use super::RuntimeDeps;
use crate::store::MatchRecord;

/// Process-wide index of live match runtimes. The only global mutable state
/// in the core; runtimes remove themselves at end-of-life.
pub struct MatchRegistry {
    inner: RwLock<HashMap<Uuid, RuntimeHandle>>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the runtime for a match, spawning it on first use. Holding the
    /// write lock across the spawn means concurrent callers get the same
    /// runtime.
    pub async fn get_or_create(&self, record: &MatchRecord, deps: &RuntimeDeps) -> RuntimeHandle {
        let mut map = self.inner.write().await;
        if let Some(handle) = map.get(&record.id) {
            return handle.clone();
        }
        let handle = MatchRuntime::spawn(record, deps.clone());
        map.insert(record.id, handle.clone());
        tracing::info!(match_id = %record.id, "match runtime created");
        handle
    }

    pub async fn get(&self, id: Uuid) -> Option<RuntimeHandle> {
        self.inner.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) {
        self.inner.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}
