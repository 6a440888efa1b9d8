//! Experiment metadata: an in-memory registry, a write-through TTL cache for
//! remote catalogs, and JSON seeding.

use dashmap::DashMap;
use pisces_core::store::{ExperimentProvider, ExperimentRepository};
use pisces_core::types::ExperimentDefinition;
use pisces_core::PiscesResult;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Registry of experiment definitions, keyed by experiment id.
#[derive(Default)]
pub struct ExperimentRegistry {
    experiments: DashMap<String, Arc<ExperimentDefinition>>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = ExperimentDefinition>) -> Self {
        let registry = Self::new();
        for definition in definitions {
            registry.upsert(definition);
        }
        registry
    }

    /// Insert or replace a definition, returning the previous one.
    pub fn upsert(&self, definition: ExperimentDefinition) -> Option<Arc<ExperimentDefinition>> {
        self.experiments
            .insert(definition.id.clone(), Arc::new(definition))
    }

    pub fn remove(&self, experiment_id: &str) -> Option<Arc<ExperimentDefinition>> {
        self.experiments.remove(experiment_id).map(|(_, def)| def)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

impl ExperimentProvider for ExperimentRegistry {
    fn get(&self, experiment_id: &str) -> PiscesResult<Option<Arc<ExperimentDefinition>>> {
        Ok(self
            .experiments
            .get(experiment_id)
            .map(|def| def.value().clone()))
    }
}

impl ExperimentRepository for ExperimentRegistry {
    fn save(&self, definition: ExperimentDefinition) -> PiscesResult<()> {
        self.upsert(definition);
        Ok(())
    }

    fn delete(&self, experiment_id: &str) -> PiscesResult<bool> {
        Ok(self.remove(experiment_id).is_some())
    }
}

/// Save every definition in a JSON array whose id the catalog does not hold
/// yet. Definitions already present are left untouched, so a restart never
/// reverts changes made through the catalog. Returns how many were saved.
pub fn seed_from_json(
    catalog: &dyn ExperimentRepository,
    path: impl AsRef<Path>,
) -> PiscesResult<usize> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let definitions: Vec<ExperimentDefinition> = serde_json::from_str(&raw)?;
    let total = definitions.len();
    let mut saved = 0;
    for definition in definitions {
        if catalog.get(&definition.id)?.is_none() {
            catalog.save(definition)?;
            saved += 1;
        }
    }
    info!(path = %path.display(), total, saved, "Experiment definitions seeded");
    Ok(saved)
}

struct CacheEntry {
    definition: Arc<ExperimentDefinition>,
    inserted_at: Instant,
}

/// Pull-through cache over a remote catalog. Entries older than the TTL are
/// refetched; absent experiments are never cached. Writes go through to the
/// catalog and drop the local entry, so other nodes converge within one TTL.
pub struct CachedExperimentProvider {
    inner: Arc<dyn ExperimentRepository>,
    store: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl CachedExperimentProvider {
    pub fn new(inner: Arc<dyn ExperimentRepository>, ttl: Duration) -> Self {
        Self {
            inner,
            store: DashMap::new(),
            ttl,
        }
    }

    /// Remove expired entries.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn cached(&self, experiment_id: &str) -> Option<Arc<ExperimentDefinition>> {
        let entry = self.store.get(experiment_id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(experiment_id);
            return None;
        }
        Some(entry.definition.clone())
    }
}

impl ExperimentProvider for CachedExperimentProvider {
    fn get(&self, experiment_id: &str) -> PiscesResult<Option<Arc<ExperimentDefinition>>> {
        if let Some(definition) = self.cached(experiment_id) {
            metrics::counter!("cache.metadata.hit").increment(1);
            return Ok(Some(definition));
        }
        metrics::counter!("cache.metadata.miss").increment(1);

        let fetched = self.inner.get(experiment_id)?;
        match &fetched {
            Some(definition) => {
                self.store.insert(
                    experiment_id.to_string(),
                    CacheEntry {
                        definition: definition.clone(),
                        inserted_at: Instant::now(),
                    },
                );
            }
            None => debug!(experiment_id, "Experiment metadata not found"),
        }
        Ok(fetched)
    }
}

impl ExperimentRepository for CachedExperimentProvider {
    fn save(&self, definition: ExperimentDefinition) -> PiscesResult<()> {
        let experiment_id = definition.id.clone();
        self.inner.save(definition)?;
        self.store.remove(&experiment_id);
        Ok(())
    }

    fn delete(&self, experiment_id: &str) -> PiscesResult<bool> {
        let removed = self.inner.delete(experiment_id)?;
        self.store.remove(experiment_id);
        Ok(removed)
    }
}
