//! Top-level assignment decision for a (visitor, experiment) pair.

use crate::ratio;
use chrono::{DateTime, Utc};
use pisces_bandit::{BanditAlgorithm, BanditEngine};
use pisces_core::hashing::{bucket_key, gate_key, hash_u64, partition};
use pisces_core::store::{ExperimentProvider, StickyStore};
use pisces_core::types::{ExperimentDefinition, TrafficStrategy};
use pisces_core::{PiscesError, PiscesResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Salt for the HASH/RULE bucket draw when the experiment sets no hash key.
pub const DEFAULT_HASH_SALT: &str = "visitorId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Sticky,
    Whitelist,
    Allocated,
}

/// Why a visitor was left out of an experiment. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    NotRunning,
    Blacklisted,
    OutsideWindow,
    OutsideTraffic,
    NoGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Assigned {
        group_id: String,
        source: AssignmentSource,
    },
    NotAssigned {
        reason: Exclusion,
    },
}

impl Decision {
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Assigned { group_id, .. } => Some(group_id),
            Self::NotAssigned { .. } => None,
        }
    }

    pub fn into_group(self) -> Option<String> {
        match self {
            Self::Assigned { group_id, .. } => Some(group_id),
            Self::NotAssigned { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Assigned { source, .. } => match source {
                AssignmentSource::Sticky => "sticky",
                AssignmentSource::Whitelist => "whitelist",
                AssignmentSource::Allocated => "allocated",
            },
            Self::NotAssigned { reason } => match reason {
                Exclusion::NotRunning => "not_running",
                Exclusion::Blacklisted => "blacklisted",
                Exclusion::OutsideWindow => "outside_window",
                Exclusion::OutsideTraffic => "outside_traffic",
                Exclusion::NoGroup => "no_group",
            },
        }
    }
}

/// Where RANDOM allocation draws come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RandomSource {
    #[default]
    Entropy,
    /// Reproducible draws derived from the seed and the visitor/experiment key.
    Seeded(u64),
}

impl RandomSource {
    fn draw(&self, visitor_id: &str, experiment_id: &str) -> f64 {
        match self {
            Self::Entropy => rand::thread_rng().gen(),
            Self::Seeded(seed) => {
                let key = gate_key(visitor_id, experiment_id);
                StdRng::seed_from_u64(seed ^ hash_u64(&key)).gen()
            }
        }
    }
}

pub struct TrafficAllocator {
    experiments: Arc<dyn ExperimentProvider>,
    sticky: Arc<dyn StickyStore>,
    bandits: Arc<BanditEngine>,
    random: RandomSource,
}

impl TrafficAllocator {
    pub fn new(
        experiments: Arc<dyn ExperimentProvider>,
        sticky: Arc<dyn StickyStore>,
        bandits: Arc<BanditEngine>,
    ) -> Self {
        Self {
            experiments,
            sticky,
            bandits,
            random: RandomSource::Entropy,
        }
    }

    pub fn with_random_source(mut self, random: RandomSource) -> Self {
        self.random = random;
        self
    }

    /// Assign the visitor to a group, or `None` when the visitor is outside
    /// the experiment's population. Unknown experiments are an error.
    pub fn assign_group(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> PiscesResult<Option<String>> {
        Ok(self.decide(experiment_id, visitor_id)?.into_group())
    }

    /// Sticky lookup first, falling back to a fresh assignment.
    pub fn get_group_for_visitor(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> PiscesResult<Option<String>> {
        if let Some(group_id) = self.sticky.get(visitor_id, experiment_id)? {
            return Ok(Some(group_id));
        }
        self.assign_group(experiment_id, visitor_id)
    }

    /// Every experiment the visitor is currently assigned in.
    pub fn visitor_experiments(&self, visitor_id: &str) -> PiscesResult<HashMap<String, String>> {
        self.sticky.experiments_for_visitor(visitor_id)
    }

    pub fn decide(&self, experiment_id: &str, visitor_id: &str) -> PiscesResult<Decision> {
        self.decide_at(experiment_id, visitor_id, Utc::now())
    }

    /// Full decision with the reason, evaluated at `now`.
    pub fn decide_at(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        now: DateTime<Utc>,
    ) -> PiscesResult<Decision> {
        let decision = self.evaluate(experiment_id, visitor_id, now)?;
        metrics::counter!("traffic.assign", "outcome" => decision.label()).increment(1);
        debug!(
            experiment_id,
            visitor_id,
            outcome = decision.label(),
            group_id = ?decision.group_id(),
            "Traffic decision"
        );
        Ok(decision)
    }

    fn evaluate(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        now: DateTime<Utc>,
    ) -> PiscesResult<Decision> {
        // An existing assignment wins over every later config change.
        if let Some(group_id) = self.sticky.get(visitor_id, experiment_id)? {
            return Ok(Decision::Assigned {
                group_id,
                source: AssignmentSource::Sticky,
            });
        }

        let definition = self
            .experiments
            .get(experiment_id)?
            .ok_or_else(|| PiscesError::ExperimentNotFound(experiment_id.to_string()))?;

        if !definition.is_running() {
            return Ok(not_assigned(Exclusion::NotRunning));
        }

        if definition.whitelist.contains(visitor_id) {
            if let Some(first) = definition.first_group() {
                let group_id = self.stick(visitor_id, experiment_id, &first.id)?;
                return Ok(Decision::Assigned {
                    group_id,
                    source: AssignmentSource::Whitelist,
                });
            }
        }

        if definition.blacklist.contains(visitor_id) {
            return Ok(not_assigned(Exclusion::Blacklisted));
        }

        if !definition.is_within_window(now) {
            return Ok(not_assigned(Exclusion::OutsideWindow));
        }

        let gate = partition(&gate_key(visitor_id, experiment_id));
        if gate >= definition.traffic.total_traffic {
            return Ok(not_assigned(Exclusion::OutsideTraffic));
        }

        match self.allocate(&definition, visitor_id)? {
            Some(selected) => {
                let group_id = self.stick(visitor_id, experiment_id, &selected)?;
                Ok(Decision::Assigned {
                    group_id,
                    source: AssignmentSource::Allocated,
                })
            }
            None => Ok(not_assigned(Exclusion::NoGroup)),
        }
    }

    fn allocate(
        &self,
        definition: &ExperimentDefinition,
        visitor_id: &str,
    ) -> PiscesResult<Option<String>> {
        let traffic = &definition.traffic;
        let picked = match traffic.strategy {
            TrafficStrategy::Random => {
                let draw = self.random.draw(visitor_id, &definition.id);
                ratio::pick(&traffic.allocation, draw)
            }
            TrafficStrategy::Hash | TrafficStrategy::Rule => {
                let salt = traffic.hash_key.as_deref().unwrap_or(DEFAULT_HASH_SALT);
                let draw = partition(&bucket_key(salt, visitor_id, &definition.id));
                ratio::pick(&traffic.allocation, draw)
            }
            TrafficStrategy::ThompsonSampling => {
                return self
                    .bandits
                    .select_for(definition, BanditAlgorithm::ThompsonSampling)
            }
            TrafficStrategy::Ucb => {
                return self.bandits.select_for(definition, BanditAlgorithm::Ucb1)
            }
        };
        Ok(picked.map(str::to_string))
    }

    /// Write the assignment unless one already exists; returns the stored group.
    fn stick(&self, visitor_id: &str, experiment_id: &str, group_id: &str) -> PiscesResult<String> {
        let winner = self
            .sticky
            .put_if_absent(visitor_id, experiment_id, group_id)?;
        if winner != group_id {
            metrics::counter!("traffic.sticky.race_lost").increment(1);
            warn!(
                experiment_id,
                visitor_id,
                selected = group_id,
                stored = %winner,
                "Concurrent assignment won; using stored group"
            );
        }
        Ok(winner)
    }
}

fn not_assigned(reason: Exclusion) -> Decision {
    Decision::NotAssigned { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pisces_cache::{ExperimentRegistry, LocalStore};
    use pisces_core::types::{
        ExperimentStatus, GroupAllocation, GroupDefinition, TrafficConfig,
    };
    use std::collections::HashSet;
    use std::sync::Barrier;

    fn experiment(id: &str, strategy: TrafficStrategy, ratios: &[(&str, f64)]) -> ExperimentDefinition {
        ExperimentDefinition {
            id: id.to_string(),
            name: format!("{id} test"),
            status: ExperimentStatus::Running,
            start_time: Some(Utc::now() - Duration::days(1)),
            end_time: Some(Utc::now() + Duration::days(30)),
            groups: ratios
                .iter()
                .map(|(group, ratio)| GroupDefinition {
                    id: group.to_string(),
                    name: None,
                    traffic_ratio: *ratio,
                })
                .collect(),
            traffic: TrafficConfig {
                total_traffic: 1.0,
                strategy,
                hash_key: None,
                allocation: ratios
                    .iter()
                    .map(|(group, ratio)| GroupAllocation {
                        group: group.to_string(),
                        ratio: *ratio,
                    })
                    .collect(),
            },
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
        }
    }

    fn ab(id: &str, strategy: TrafficStrategy) -> ExperimentDefinition {
        experiment(id, strategy, &[("A", 0.5), ("B", 0.5)])
    }

    fn make_allocator(
        definitions: Vec<ExperimentDefinition>,
    ) -> (TrafficAllocator, Arc<ExperimentRegistry>, Arc<LocalStore>) {
        let registry = Arc::new(ExperimentRegistry::from_definitions(definitions));
        let store = Arc::new(LocalStore::new());
        let bandits = Arc::new(BanditEngine::new(registry.clone(), store.clone()));
        let allocator = TrafficAllocator::new(registry.clone(), store.clone(), bandits);
        (allocator, registry, store)
    }

    #[test]
    fn test_unknown_experiment_is_an_error() {
        let (allocator, _, _) = make_allocator(Vec::new());
        let err = allocator.assign_group("missing", "v1").unwrap_err();
        assert!(matches!(err, PiscesError::ExperimentNotFound(ref id) if id == "missing"));
    }

    #[test]
    fn test_non_running_experiments_assign_nothing() {
        for status in [
            ExperimentStatus::Draft,
            ExperimentStatus::Paused,
            ExperimentStatus::Stopped,
        ] {
            let mut def = ab("exp", TrafficStrategy::Hash);
            def.status = status;
            let (allocator, _, store) = make_allocator(vec![def]);
            assert_eq!(
                allocator.decide("exp", "v1").unwrap(),
                Decision::NotAssigned {
                    reason: Exclusion::NotRunning
                }
            );
            assert_eq!(store.visitor_count(), 0);
        }
    }

    #[test]
    fn test_whitelist_always_gets_first_group() {
        let mut def = ab("exp", TrafficStrategy::Hash);
        def.traffic.total_traffic = 0.0;
        def.traffic.allocation = vec![GroupAllocation {
            group: "B".to_string(),
            ratio: 1.0,
        }];
        def.start_time = Some(Utc::now() + Duration::days(5));
        def.whitelist.insert("vip".to_string());
        // Whitelist is checked before the blacklist.
        def.blacklist.insert("vip".to_string());
        let (allocator, _, store) = make_allocator(vec![def]);

        assert_eq!(
            allocator.decide("exp", "vip").unwrap(),
            Decision::Assigned {
                group_id: "A".to_string(),
                source: AssignmentSource::Whitelist
            }
        );
        assert_eq!(store.get("vip", "exp").unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_blacklist_excludes_even_when_whitelisted_elsewhere() {
        let mut blocked = ab("exp-1", TrafficStrategy::Hash);
        blocked.blacklist.insert("v1".to_string());
        let mut open = ab("exp-2", TrafficStrategy::Hash);
        open.whitelist.insert("v1".to_string());
        let (allocator, _, _) = make_allocator(vec![blocked, open]);

        for _ in 0..3 {
            assert_eq!(allocator.assign_group("exp-1", "v1").unwrap(), None);
        }
        assert_eq!(
            allocator.decide("exp-1", "v1").unwrap(),
            Decision::NotAssigned {
                reason: Exclusion::Blacklisted
            }
        );
        assert_eq!(
            allocator.assign_group("exp-2", "v1").unwrap().as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_time_window() {
        let mut future = ab("future", TrafficStrategy::Hash);
        future.start_time = Some(Utc::now() + Duration::days(1));
        let mut ended = ab("ended", TrafficStrategy::Hash);
        ended.end_time = Some(Utc::now() - Duration::days(1));
        let mut open = ab("open", TrafficStrategy::Hash);
        open.start_time = None;
        open.end_time = None;
        let (allocator, _, _) = make_allocator(vec![future, ended, open]);

        let outside = Decision::NotAssigned {
            reason: Exclusion::OutsideWindow,
        };
        assert_eq!(allocator.decide("future", "v1").unwrap(), outside);
        assert_eq!(allocator.decide("ended", "v1").unwrap(), outside);
        assert!(allocator.assign_group("open", "v1").unwrap().is_some());
    }

    #[test]
    fn test_total_traffic_gate() {
        let mut closed = ab("closed", TrafficStrategy::Hash);
        closed.traffic.total_traffic = 0.0;
        let mut partial = ab("partial", TrafficStrategy::Hash);
        partial.traffic.total_traffic = 0.3;
        let (allocator, _, _) = make_allocator(vec![closed, partial]);

        let n = 10_000;
        let mut admitted = 0;
        for i in 0..n {
            let visitor = format!("visitor-{i}");
            assert_eq!(allocator.assign_group("closed", &visitor).unwrap(), None);
            if allocator.assign_group("partial", &visitor).unwrap().is_some() {
                admitted += 1;
            }
        }
        let share = admitted as f64 / n as f64;
        assert!((share - 0.3).abs() < 0.03, "admitted share {share}");
    }

    #[test]
    fn test_hash_assignment_is_deterministic_without_cache() {
        let (first, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        let (second, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        for i in 0..200 {
            let visitor = format!("visitor-{i}");
            assert_eq!(
                first.assign_group("exp", &visitor).unwrap(),
                second.assign_group("exp", &visitor).unwrap()
            );
        }
    }

    #[test]
    fn test_seeded_random_assignment_is_deterministic() {
        let (first, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Random)]);
        let first = first.with_random_source(RandomSource::Seeded(7));
        let (second, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Random)]);
        let second = second.with_random_source(RandomSource::Seeded(7));
        for i in 0..200 {
            let visitor = format!("visitor-{i}");
            let group = first.assign_group("exp", &visitor).unwrap();
            assert!(group.is_some());
            assert_eq!(group, second.assign_group("exp", &visitor).unwrap());
        }
    }

    #[test]
    fn test_hash_partition_coverage() {
        let (allocator, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        let n = 10_000;
        let mut a_count = 0;
        for i in 0..n {
            match allocator
                .assign_group("exp", &format!("visitor-{i}"))
                .unwrap()
                .as_deref()
            {
                Some("A") => a_count += 1,
                Some("B") => {}
                other => panic!("unexpected assignment {other:?}"),
            }
        }
        let share = a_count as f64 / n as f64;
        assert!((share - 0.5).abs() < 0.03, "group A share {share}");
    }

    #[test]
    fn test_hash_key_changes_bucketing() {
        let mut salted = ab("exp", TrafficStrategy::Rule);
        salted.traffic.hash_key = Some("checkout-v2".to_string());
        let (plain, _, _) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        let (salted, _, _) = make_allocator(vec![salted]);

        let differing = (0..500)
            .filter(|i| {
                let visitor = format!("visitor-{i}");
                plain.assign_group("exp", &visitor).unwrap()
                    != salted.assign_group("exp", &visitor).unwrap()
            })
            .count();
        assert!(differing > 100, "only {differing} visitors moved");
    }

    #[test]
    fn test_assignment_is_sticky_across_config_changes() {
        let (allocator, registry, _) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        let first = allocator.assign_group("exp", "v1").unwrap().unwrap();

        let other = if first == "A" { "B" } else { "A" };
        let mut changed = experiment("exp", TrafficStrategy::Hash, &[(other, 1.0)]);
        changed.blacklist.insert("v1".to_string());
        changed.status = ExperimentStatus::Paused;
        registry.upsert(changed);

        for _ in 0..5 {
            assert_eq!(
                allocator.get_group_for_visitor("exp", "v1").unwrap().as_deref(),
                Some(first.as_str())
            );
        }
        assert_eq!(
            allocator.decide("exp", "v1").unwrap(),
            Decision::Assigned {
                group_id: first.clone(),
                source: AssignmentSource::Sticky
            }
        );
    }

    #[test]
    fn test_get_group_falls_back_to_assignment() {
        let (allocator, _, store) = make_allocator(vec![ab("exp", TrafficStrategy::Hash)]);
        let group = allocator.get_group_for_visitor("exp", "v1").unwrap();
        assert!(group.is_some());
        assert_eq!(store.get("v1", "exp").unwrap(), group);
    }

    #[test]
    fn test_empty_allocation_assigns_nothing() {
        let def = experiment("exp", TrafficStrategy::Hash, &[]);
        let (allocator, _, _) = make_allocator(vec![def]);
        assert_eq!(
            allocator.decide("exp", "v1").unwrap(),
            Decision::NotAssigned {
                reason: Exclusion::NoGroup
            }
        );
    }

    #[test]
    fn test_ucb_strategy_explores_each_arm_first() {
        let def = experiment(
            "exp",
            TrafficStrategy::Ucb,
            &[("A", 0.0), ("B", 0.0), ("C", 0.0)],
        );
        let (allocator, _, _) = make_allocator(vec![def]);
        let groups: Vec<_> = ["v1", "v2", "v3"]
            .iter()
            .map(|v| allocator.assign_group("exp", v).unwrap().unwrap())
            .collect();
        assert_eq!(groups, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_thompson_strategy_ignores_ratio_table() {
        let mut def = ab("exp", TrafficStrategy::ThompsonSampling);
        def.traffic.allocation.clear();
        let (allocator, _, _) = make_allocator(vec![def]);
        for i in 0..50 {
            let group = allocator
                .assign_group("exp", &format!("visitor-{i}"))
                .unwrap();
            assert!(matches!(group.as_deref(), Some("A") | Some("B")));
        }
    }

    #[test]
    fn test_concurrent_first_assignments_converge() {
        let def = experiment(
            "exp",
            TrafficStrategy::Random,
            &[("A", 0.34), ("B", 0.33), ("C", 0.33)],
        );
        let (allocator, _, _) = make_allocator(vec![def]);
        let barrier = Barrier::new(100);

        let groups: HashSet<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    let allocator = &allocator;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        allocator.assign_group("exp", "racer").unwrap().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_visitor_experiments() {
        let (allocator, _, _) = make_allocator(vec![
            ab("exp-1", TrafficStrategy::Hash),
            ab("exp-2", TrafficStrategy::Hash),
        ]);
        let g1 = allocator.assign_group("exp-1", "v1").unwrap().unwrap();
        let g2 = allocator.assign_group("exp-2", "v1").unwrap().unwrap();

        let listing = allocator.visitor_experiments("v1").unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["exp-1"], g1);
        assert_eq!(listing["exp-2"], g2);
    }
}
