//! The storage collaborators one node runs with, bundled for `AppState`.

use pisces_analytics::EventCounters;
use pisces_cache::{CachedExperimentProvider, ExperimentRegistry, LocalStore, RedisStore};
use pisces_core::store::{
    BanditStore, EventCounterProvider, EventCounterSink, ExperimentProvider,
    ExperimentRepository, StickyStore,
};
use std::sync::Arc;
use std::time::Duration;

pub struct Stores {
    /// Read path used by the engines.
    pub experiments: Arc<dyn ExperimentProvider>,
    /// Write path used by the admin routes. Shares state with `experiments`.
    pub catalog: Arc<dyn ExperimentRepository>,
    pub sticky: Arc<dyn StickyStore>,
    pub bandits: Arc<dyn BanditStore>,
    pub event_counts: Arc<dyn EventCounterProvider>,
    pub event_sink: Arc<dyn EventCounterSink>,
    /// Set when a metadata cache sits in front of a remote catalog.
    pub metadata_cache: Option<Arc<CachedExperimentProvider>>,
}

impl Stores {
    /// Single-node state held in process memory.
    pub fn in_memory() -> Self {
        let registry = Arc::new(ExperimentRegistry::new());
        let local = Arc::new(LocalStore::new());
        let counters = Arc::new(EventCounters::new());
        Self {
            experiments: registry.clone(),
            catalog: registry,
            sticky: local.clone(),
            bandits: local,
            event_counts: counters.clone(),
            event_sink: counters,
            metadata_cache: None,
        }
    }

    /// Every concern backed by one shared Redis deployment.
    pub fn redis(store: Arc<RedisStore>) -> Self {
        Self {
            experiments: store.clone(),
            catalog: store.clone(),
            sticky: store.clone(),
            bandits: store.clone(),
            event_counts: store.clone(),
            event_sink: store,
            metadata_cache: None,
        }
    }

    /// Put a TTL cache in front of the catalog. Reads and writes both go
    /// through it so a local write is never shadowed by a stale entry.
    pub fn with_metadata_cache(mut self, ttl: Duration) -> Self {
        let cache = Arc::new(CachedExperimentProvider::new(self.catalog.clone(), ttl));
        self.experiments = cache.clone();
        self.catalog = cache.clone();
        self.metadata_cache = Some(cache);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pisces_core::types::{EventType, ExperimentDefinition};

    fn definition(id: &str) -> ExperimentDefinition {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": "RUNNING",
            "groups": [{"id": "A"}],
            "traffic": {"total_traffic": 1.0, "strategy": "RANDOM"}
        }))
        .unwrap()
    }

    #[test]
    fn test_in_memory_catalog_feeds_engine_reads() {
        let stores = Stores::in_memory();
        stores.catalog.save(definition("exp")).unwrap();
        assert!(stores.experiments.get("exp").unwrap().is_some());
        assert!(stores.metadata_cache.is_none());

        stores.event_sink.increment("exp", "A", EventType::View).unwrap();
        assert_eq!(
            stores.event_counts.event_count("exp", "A", EventType::View).unwrap(),
            1
        );
    }

    #[test]
    fn test_metadata_cache_wraps_both_paths() {
        let stores = Stores::in_memory().with_metadata_cache(Duration::from_secs(60));
        stores.catalog.save(definition("exp")).unwrap();
        assert!(stores.experiments.get("exp").unwrap().is_some());

        let cache = stores.metadata_cache.as_ref().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(stores.catalog.delete("exp").unwrap());
        assert!(cache.is_empty());
        assert!(stores.experiments.get("exp").unwrap().is_none());
    }
}
