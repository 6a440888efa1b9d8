//! In-memory event counters keyed by (experiment, group).

use dashmap::DashMap;
use pisces_core::store::{EventCounterProvider, EventCounterSink};
use pisces_core::types::EventType;
use pisces_core::PiscesResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// One atomic counter per event type, indexed by `EventType::index`.
#[derive(Default)]
pub struct EventCounters {
    counts: DashMap<(String, String), [AtomicU64; 3]>,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` and return the new count.
    pub fn add(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
        amount: u64,
    ) -> u64 {
        let idx = event_type.index();
        let key = (experiment_id.to_string(), group_id.to_string());
        if let Some(counters) = self.counts.get(&key) {
            return counters[idx].fetch_add(amount, Ordering::Relaxed) + amount;
        }
        let counters = self.counts.entry(key).or_default();
        counters[idx].fetch_add(amount, Ordering::Relaxed) + amount
    }

    pub fn count(&self, experiment_id: &str, group_id: &str, event_type: EventType) -> u64 {
        self.counts
            .get(&(experiment_id.to_string(), group_id.to_string()))
            .map(|counters| counters[event_type.index()].load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl EventCounterSink for EventCounters {
    fn increment(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64> {
        Ok(self.add(experiment_id, group_id, event_type, 1))
    }
}

impl EventCounterProvider for EventCounters {
    fn event_count(
        &self,
        experiment_id: &str,
        group_id: &str,
        event_type: EventType,
    ) -> PiscesResult<u64> {
        Ok(self.count(experiment_id, group_id, event_type))
    }
}
