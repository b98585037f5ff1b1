use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::descriptor::QueryKey;
use crate::error::CacheError;

/// The client-side query cache the subscription layer invalidates. The layer
/// never owns cache storage itself.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Mark every query under `key` stale and let observers refetch.
    async fn invalidate_queries(&self, key: &QueryKey) -> Result<(), CacheError>;

    async fn set_query_data(&self, key: &QueryKey, value: Value) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Option<Value>,
    pub stale: bool,
    pub updated_at: Instant,
    pub invalidations: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, CacheEntry>,
    history: Vec<QueryKey>,
}

/// Process-local cache with prefix invalidation: invalidating `["jobs"]`
/// also marks `["jobs","5"]` stale.
pub struct InMemoryQueryCache {
    state: Mutex<CacheState>,
    invalidated: broadcast::Sender<QueryKey>,
}

impl Default for InMemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        let (invalidated, _) = broadcast::channel(256);
        Self { state: Mutex::new(CacheState::default()), invalidated }
    }

    /// Observe invalidation targets; an observer refetches the keys it renders.
    pub fn watch(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidated.subscribe()
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.state.lock().entries.get(key).map(|e| e.stale).unwrap_or(true)
    }

    /// Invalidation targets in the order they were requested.
    pub fn history(&self) -> Vec<QueryKey> {
        self.state.lock().history.clone()
    }

    pub fn invalidation_count(&self, key: &QueryKey) -> usize {
        self.state.lock().history.iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn invalidate_queries(&self, key: &QueryKey) -> Result<(), CacheError> {
        {
            let mut state = self.state.lock();
            state.history.push(key.clone());
            for (cached, entry) in state.entries.iter_mut() {
                if cached.starts_with(key) {
                    entry.stale = true;
                    entry.invalidations += 1;
                }
            }
        }
        trace!("Invalidated {}", key);
        // No receivers just means nothing is rendered right now.
        let _ = self.invalidated.send(key.clone());
        Ok(())
    }

    async fn set_query_data(&self, key: &QueryKey, value: Value) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let entry = state.entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            data: None,
            stale: false,
            updated_at: Instant::now(),
            invalidations: 0,
        });
        entry.data = Some(value);
        entry.stale = false;
        entry.updated_at = Instant::now();
        Ok(())
    }
}
