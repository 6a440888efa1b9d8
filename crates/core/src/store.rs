//! Contracts between the decision engine and its storage/metadata collaborators.
//!
//! Every implementation must be safe to share across request threads. Writes are
//! per-key atomic; reads may observe slightly stale values.

use crate::error::PiscesResult;
use crate::types::{ArmCounters, EventType, ExperimentDefinition};
use std::collections::HashMap;
use std::sync::Arc;

/// Source of experiment definitions. Must reflect the latest saved configuration.
pub trait ExperimentProvider: Send + Sync {
    fn get(&self, experiment_id: &str) -> PiscesResult<Option<Arc<ExperimentDefinition>>>;
}

/// Writable experiment catalog. Saved definitions are visible to `get` on
/// every provider that reads the same backing store.
pub trait ExperimentRepository: ExperimentProvider {
    /// Insert or replace the definition stored under `definition.id`.
    fn save(&self, definition: ExperimentDefinition) -> PiscesResult<()>;

    /// Returns `false` when no definition was stored under the id.
    fn delete(&self, experiment_id: &str) -> PiscesResult<bool>;
}

/// Aggregated event counts per (experiment, group, event type).
pub trait EventCounterProvider: Send + Sync {
    fn event_count(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64>;
}

/// Write side of the event counters.
pub trait EventCounterSink: Send + Sync {
    /// Increment by one and return the new count.
    fn increment(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64>;
}

/// Sticky (visitor, experiment) -> group mapping.
pub trait StickyStore: Send + Sync {
    fn get(&self, visitor_id: &str, experiment_id: &str) -> PiscesResult<Option<String>>;

    /// Compare-and-set-or-return-existing. Returns the group that is stored after
    /// the call, which is `group_id` only if no assignment existed before.
    fn put_if_absent(
        &self,
        visitor_id: &str,
        experiment_id: &str,
        group_id: &str,
    ) -> PiscesResult<String>;

    /// All experiments the visitor is assigned in, keyed by experiment id.
    fn experiments_for_visitor(&self, visitor_id: &str) -> PiscesResult<HashMap<String, String>>;
}

/// Per-arm bandit counters. Arms are created lazily with all counters at zero.
pub trait BanditStore: Send + Sync {
    fn arm(&self, experiment_id: &str, group_id: &str) -> PiscesResult<ArmCounters>;

    fn total_trials(&self, experiment_id: &str) -> PiscesResult<u64>;

    /// Increment the arm's trial counter and the experiment's total trial counter.
    fn record_trial(&self, experiment_id: &str, group_id: &str) -> PiscesResult<()>;

    /// Increment the arm's success or failure counter.
    fn record_reward(&self, experiment_id: &str, group_id: &str, success: bool)
        -> PiscesResult<()>;
}
