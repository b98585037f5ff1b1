use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::descriptor::QueryKey;
use crate::event::ChangeEvent;

/// Turns change events into cache invalidations.
///
/// Invalidation is coarse on purpose: the payload is never inspected, any
/// change on a channel invalidates every query key registered for it.
/// Concurrent invalidations of the same key are left to the cache to
/// deduplicate.
#[derive(Clone)]
pub struct InvalidationDispatcher {
    cache: Arc<dyn QueryCache>,
}

impl InvalidationDispatcher {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self { cache }
    }

    /// Returns true when every key was invalidated.
    pub async fn dispatch(&self, event: &ChangeEvent, query_keys: &[QueryKey]) -> bool {
        debug!("{:?} on {} -> {} query keys", event.kind, event.table, query_keys.len());
        let mut all = true;
        for key in query_keys {
            all &= self.invalidate(key).await;
        }
        all
    }

    /// Invalidate a single key. Failures leave the cached data in place and
    /// return false.
    pub async fn invalidate(&self, key: &QueryKey) -> bool {
        match self.cache.invalidate_queries(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to invalidate {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::cache::InMemoryQueryCache;
    use crate::error::CacheError;

    #[tokio::test]
    async fn invalidates_exactly_the_supplied_keys() {
        let cache = Arc::new(InMemoryQueryCache::new());
        let dispatcher = InvalidationDispatcher::new(cache.clone());
        let keys = vec![QueryKey::from("jobs"), QueryKey::from(["jobs", "5"])];

        // The event's table plays no part in what gets invalidated.
        assert!(dispatcher.dispatch(&ChangeEvent::insert("tours", json!({ "id": 1 })), &keys).await);

        assert_eq!(cache.history(), keys);
    }

    struct BrokenCache;

    #[async_trait]
    impl QueryCache for BrokenCache {
        async fn invalidate_queries(&self, _key: &QueryKey) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("refetch failed".into()))
        }

        async fn set_query_data(&self, _key: &QueryKey, _value: Value) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cache_failures_are_swallowed_and_reported() {
        let dispatcher = InvalidationDispatcher::new(Arc::new(BrokenCache));
        let delivered = dispatcher
            .dispatch(&ChangeEvent::delete("jobs", json!({ "id": 1 })), &[QueryKey::from("jobs")])
            .await;
        assert!(!delivered);
        assert!(!dispatcher.invalidate(&QueryKey::from("tours")).await);
    }
}
