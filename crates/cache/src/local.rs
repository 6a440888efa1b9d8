//! In-process store backed by DashMap for lock-free concurrent access.
//! Holds sticky assignments and bandit counters for single-node deployments.

use dashmap::DashMap;
use pisces_core::store::{BanditStore, StickyStore};
use pisces_core::types::ArmCounters;
use pisces_core::PiscesResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ArmState {
    trials: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ArmState {
    fn snapshot(&self) -> ArmCounters {
        ArmCounters {
            trials: self.trials.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct ExperimentArms {
    total_trials: AtomicU64,
    arms: DashMap<String, Arc<ArmState>>,
}

impl ExperimentArms {
    fn arm(&self, group_id: &str) -> Arc<ArmState> {
        if let Some(arm) = self.arms.get(group_id) {
            return arm.value().clone();
        }
        self.arms
            .entry(group_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

/// Sharded in-memory store. Each visitor's assignments live under one shard
/// lock, so a first-time write for a (visitor, experiment) pair is a single
/// compare-and-set. Bandit counters are plain atomics.
#[derive(Default)]
pub struct LocalStore {
    assignments: DashMap<String, HashMap<String, String>>,
    bandits: DashMap<String, Arc<ExperimentArms>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn experiment(&self, experiment_id: &str) -> Arc<ExperimentArms> {
        if let Some(experiment) = self.bandits.get(experiment_id) {
            return experiment.value().clone();
        }
        self.bandits
            .entry(experiment_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Number of visitors with at least one sticky assignment.
    pub fn visitor_count(&self) -> usize {
        self.assignments.len()
    }
}

impl StickyStore for LocalStore {
    fn get(&self, visitor_id: &str, experiment_id: &str) -> PiscesResult<Option<String>> {
        Ok(self
            .assignments
            .get(visitor_id)
            .and_then(|groups| groups.get(experiment_id).cloned()))
    }

    fn put_if_absent(
        &self,
        visitor_id: &str,
        experiment_id: &str,
        group_id: &str,
    ) -> PiscesResult<String> {
        let mut groups = self.assignments.entry(visitor_id.to_string()).or_default();
        let winner = groups
            .entry(experiment_id.to_string())
            .or_insert_with(|| group_id.to_string())
            .clone();
        Ok(winner)
    }

    fn experiments_for_visitor(&self, visitor_id: &str) -> PiscesResult<HashMap<String, String>> {
        Ok(self
            .assignments
            .get(visitor_id)
            .map(|groups| groups.value().clone())
            .unwrap_or_default())
    }
}

impl BanditStore for LocalStore {
    fn arm(&self, experiment_id: &str, group_id: &str) -> PiscesResult<ArmCounters> {
        let Some(experiment) = self.bandits.get(experiment_id) else {
            return Ok(ArmCounters::default());
        };
        let counters = experiment
            .arms
            .get(group_id)
            .map(|arm| arm.snapshot())
            .unwrap_or_default();
        Ok(counters)
    }

    fn total_trials(&self, experiment_id: &str) -> PiscesResult<u64> {
        Ok(self
            .bandits
            .get(experiment_id)
            .map(|experiment| experiment.total_trials.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    fn record_trial(&self, experiment_id: &str, group_id: &str) -> PiscesResult<()> {
        let experiment = self.experiment(experiment_id);
        experiment
            .arm(group_id)
            .trials
            .fetch_add(1, Ordering::Relaxed);
        experiment.total_trials.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn record_reward(
        &self,
        experiment_id: &str,
        group_id: &str,
        success: bool,
    ) -> PiscesResult<()> {
        let arm = self.experiment(experiment_id).arm(group_id);
        let counter = if success { &arm.successes } else { &arm.failures };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
