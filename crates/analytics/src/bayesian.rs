//! Bayesian win-rate engine.
//!
//! Each group's conversion rate gets a Beta posterior under a uniform Beta(1, 1)
//! prior, `alpha = converts + 1` and `beta = views - converts + 1`. The win
//! rate `P(variant > baseline)` is estimated by Monte Carlo over both posteriors.

use pisces_core::config::MIN_MONTE_CARLO_SAMPLES;
use pisces_core::sampling::sample_posterior;
use pisces_core::store::{EventCounterProvider, ExperimentProvider};
use pisces_core::types::{
    BayesianAnalysis, BetaParameters, EarlyStopReason, EventType, ExperimentDefinition,
    WinRateResult,
};
use pisces_core::{PiscesError, PiscesResult};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_EARLY_STOP_THRESHOLD: f64 = 0.95;

pub struct WinRateEngine {
    experiments: Arc<dyn ExperimentProvider>,
    counters: Arc<dyn EventCounterProvider>,
    samples: usize,
    default_threshold: f64,
}

impl WinRateEngine {
    pub fn new(
        experiments: Arc<dyn ExperimentProvider>,
        counters: Arc<dyn EventCounterProvider>,
    ) -> Self {
        Self {
            experiments,
            counters,
            samples: MIN_MONTE_CARLO_SAMPLES,
            default_threshold: DEFAULT_EARLY_STOP_THRESHOLD,
        }
    }

    /// Sample counts below the minimum are raised to it.
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(MIN_MONTE_CARLO_SAMPLES);
        self
    }

    /// Thresholds outside (0.5, 1.0) are ignored and the current default kept.
    pub fn with_default_threshold(mut self, threshold: f64) -> Self {
        if validate_threshold(threshold).is_ok() {
            self.default_threshold = threshold;
        } else {
            warn!(
                threshold,
                kept = self.default_threshold,
                "Ignoring invalid default early-stop threshold"
            );
        }
        self
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    fn definition(&self, experiment_id: &str) -> PiscesResult<Arc<ExperimentDefinition>> {
        self.experiments
            .get(experiment_id)?
            .ok_or_else(|| PiscesError::ExperimentNotFound(experiment_id.to_string()))
    }

    /// Posterior for one group from its accumulated view and convert counts.
    pub fn posterior(&self, experiment_id: &str, group_id: &str) -> PiscesResult<BetaParameters> {
        let views = self
            .counters
            .event_count(experiment_id, group_id, EventType::View)?;
        let converts = self
            .counters
            .event_count(experiment_id, group_id, EventType::Convert)?;
        // Counters are read separately, so converts can briefly exceed views.
        Ok(BetaParameters::from_outcomes(
            converts,
            views.saturating_sub(converts),
        ))
    }

    /// `P(variant > baseline)` estimated from the current counters.
    pub fn calculate_win_rate(
        &self,
        experiment_id: &str,
        variant_group_id: &str,
        baseline_group_id: &str,
    ) -> PiscesResult<f64> {
        self.definition(experiment_id)?;
        let variant = self.posterior(experiment_id, variant_group_id)?;
        let baseline = self.posterior(experiment_id, baseline_group_id)?;

        let win_rate = self.estimate(variant, baseline, &mut rand::thread_rng());
        metrics::counter!("analysis.win_rate").increment(1);
        debug!(
            experiment_id,
            variant_group_id,
            baseline_group_id,
            win_rate,
            "Win rate estimated"
        );
        Ok(win_rate)
    }

    /// Fraction of paired posterior draws where the variant draw is larger.
    pub fn estimate<R: Rng + ?Sized>(
        &self,
        variant: BetaParameters,
        baseline: BetaParameters,
        rng: &mut R,
    ) -> f64 {
        let wins = (0..self.samples)
            .filter(|_| {
                sample_posterior(&mut *rng, variant) > sample_posterior(&mut *rng, baseline)
            })
            .count();
        wins as f64 / self.samples as f64
    }

    pub fn should_early_stop(
        &self,
        experiment_id: &str,
        variant_group_id: &str,
        baseline_group_id: &str,
        threshold: f64,
    ) -> PiscesResult<WinRateResult> {
        validate_threshold(threshold)?;
        let win_rate =
            self.calculate_win_rate(experiment_id, variant_group_id, baseline_group_id)?;
        let (can_stop, reason) = verdict(win_rate, threshold);

        Ok(WinRateResult {
            experiment_id: experiment_id.to_string(),
            variant_group_id: variant_group_id.to_string(),
            baseline_group_id: baseline_group_id.to_string(),
            win_rate,
            threshold,
            can_stop,
            reason,
        })
    }

    /// Every group after the first compared against the first, at the default threshold.
    pub fn bayesian_analysis(&self, experiment_id: &str) -> PiscesResult<BayesianAnalysis> {
        let definition = self.definition(experiment_id)?;
        let baseline = definition
            .first_group()
            .ok_or_else(|| PiscesError::NoGroups(experiment_id.to_string()))?;

        let variants = definition
            .group_ids()
            .skip(1)
            .map(|variant| {
                self.should_early_stop(experiment_id, variant, &baseline.id, self.default_threshold)
            })
            .collect::<PiscesResult<Vec<_>>>()?;

        Ok(BayesianAnalysis {
            experiment_id: experiment_id.to_string(),
            baseline_group_id: baseline.id.clone(),
            variants,
        })
    }
}

/// Thresholds must lie strictly inside (0.5, 1.0).
pub fn validate_threshold(threshold: f64) -> PiscesResult<()> {
    if threshold > 0.5 && threshold < 1.0 {
        Ok(())
    } else {
        warn!(threshold, "Rejected early-stop threshold");
        Err(PiscesError::InvalidThreshold(threshold))
    }
}

pub fn verdict(win_rate: f64, threshold: f64) -> (bool, EarlyStopReason) {
    if win_rate >= threshold {
        (true, EarlyStopReason::PositiveSignificant)
    } else if win_rate <= 1.0 - threshold {
        (true, EarlyStopReason::NegativeSignificant)
    } else {
        (false, EarlyStopReason::Inconclusive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::EventCounters;
    use pisces_cache::ExperimentRegistry;
    use pisces_core::types::{
        ExperimentStatus, GroupDefinition, TrafficConfig, TrafficStrategy,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn experiment(id: &str, groups: &[&str]) -> ExperimentDefinition {
        ExperimentDefinition {
            id: id.to_string(),
            name: String::new(),
            status: ExperimentStatus::Running,
            start_time: None,
            end_time: None,
            groups: groups
                .iter()
                .map(|g| GroupDefinition {
                    id: g.to_string(),
                    name: None,
                    traffic_ratio: 1.0 / groups.len() as f64,
                })
                .collect(),
            traffic: TrafficConfig {
                total_traffic: 1.0,
                strategy: TrafficStrategy::Hash,
                hash_key: None,
                allocation: Vec::new(),
            },
            whitelist: Default::default(),
            blacklist: Default::default(),
        }
    }

    fn engine_with(
        groups: &[&str],
        counts: &[(&str, u64, u64)],
    ) -> (WinRateEngine, Arc<EventCounters>) {
        let registry = Arc::new(ExperimentRegistry::from_definitions([experiment(
            "exp", groups,
        )]));
        let counters = Arc::new(EventCounters::new());
        for (group, views, converts) in counts {
            counters.add("exp", group, EventType::View, *views);
            counters.add("exp", group, EventType::Convert, *converts);
        }
        (WinRateEngine::new(registry, counters.clone()), counters)
    }

    #[test]
    fn test_posterior_from_counts() {
        let (engine, counters) = engine_with(&["A"], &[("A", 1000, 150)]);
        let params = engine.posterior("exp", "A").unwrap();
        assert_eq!(params.alpha, 151);
        assert_eq!(params.beta, 851);

        // Converts ahead of views never underflow.
        counters.add("exp", "B", EventType::Convert, 3);
        let params = engine.posterior("exp", "B").unwrap();
        assert_eq!((params.alpha, params.beta), (4, 1));
    }

    #[test]
    fn test_win_rate_symmetry() {
        let (engine, _) = engine_with(&["A", "B"], &[("A", 500, 60), ("B", 480, 50)]);
        let ab = engine.calculate_win_rate("exp", "A", "B").unwrap();
        let ba = engine.calculate_win_rate("exp", "B", "A").unwrap();
        assert!((ab + ba - 1.0).abs() < 0.02, "ab={ab} ba={ba}");
        assert!((0.0..=1.0).contains(&ab));
    }

    #[test]
    fn test_clear_winner_stops_positive() {
        let (engine, _) = engine_with(&["A", "B"], &[("A", 1000, 100), ("B", 1000, 150)]);
        let result = engine.should_early_stop("exp", "B", "A", 0.95).unwrap();
        assert!(result.win_rate > 0.95, "win rate {}", result.win_rate);
        assert!(result.can_stop);
        assert_eq!(result.reason, EarlyStopReason::PositiveSignificant);

        let reverse = engine.should_early_stop("exp", "A", "B", 0.95).unwrap();
        assert!(reverse.can_stop);
        assert_eq!(reverse.reason, EarlyStopReason::NegativeSignificant);
    }

    #[test]
    fn test_identical_counts_are_inconclusive() {
        let (engine, _) = engine_with(&["A", "B"], &[("A", 1000, 100), ("B", 1000, 100)]);
        let result = engine.should_early_stop("exp", "B", "A", 0.95).unwrap();
        assert!((result.win_rate - 0.5).abs() < 0.03, "win rate {}", result.win_rate);
        assert!(!result.can_stop);
        assert_eq!(result.reason, EarlyStopReason::Inconclusive);
    }

    #[test]
    fn test_no_data_is_a_coin_flip() {
        let (engine, _) = engine_with(&["A", "B"], &[]);
        let rate = engine.calculate_win_rate("exp", "B", "A").unwrap();
        assert!((rate - 0.5).abs() < 0.03, "win rate {rate}");
    }

    #[test]
    fn test_estimate_is_reproducible_with_seed() {
        let (engine, _) = engine_with(&["A"], &[]);
        let variant = BetaParameters::from_outcomes(30, 70);
        let baseline = BetaParameters::from_outcomes(25, 75);
        let first = engine.estimate(variant, baseline, &mut StdRng::seed_from_u64(11));
        let second = engine.estimate(variant, baseline, &mut StdRng::seed_from_u64(11));
        assert_eq!(first, second);
    }

    #[test]
    fn test_threshold_validation() {
        let (engine, _) = engine_with(&["A", "B"], &[]);
        for bad in [0.5, 1.0, 0.2, 1.5, f64::NAN] {
            let err = engine.should_early_stop("exp", "B", "A", bad).unwrap_err();
            assert!(matches!(err, PiscesError::InvalidThreshold(_)));
            assert!(err.is_invalid_input());
        }
        assert!(engine.should_early_stop("exp", "B", "A", 0.9).is_ok());
    }

    #[test]
    fn test_verdict_boundaries() {
        assert_eq!(verdict(0.95, 0.95), (true, EarlyStopReason::PositiveSignificant));
        assert_eq!(verdict(0.05, 0.95).1, EarlyStopReason::NegativeSignificant);
        assert_eq!(verdict(0.5, 0.95), (false, EarlyStopReason::Inconclusive));
        assert_eq!(verdict(0.85, 0.8).1, EarlyStopReason::PositiveSignificant);
    }

    #[test]
    fn test_unknown_experiment() {
        let (engine, _) = engine_with(&["A", "B"], &[]);
        assert!(matches!(
            engine.calculate_win_rate("missing", "B", "A"),
            Err(PiscesError::ExperimentNotFound(_))
        ));
        assert!(matches!(
            engine.bayesian_analysis("missing"),
            Err(PiscesError::ExperimentNotFound(_))
        ));
    }

    #[test]
    fn test_bayesian_analysis_uses_first_group_as_baseline() {
        let (engine, _) = engine_with(
            &["control", "B", "C"],
            &[("control", 1000, 100), ("B", 1000, 150), ("C", 1000, 100)],
        );
        let analysis = engine.bayesian_analysis("exp").unwrap();
        assert_eq!(analysis.baseline_group_id, "control");
        assert_eq!(analysis.variants.len(), 2);
        assert_eq!(analysis.variants[0].variant_group_id, "B");
        assert_eq!(analysis.variants[0].reason, EarlyStopReason::PositiveSignificant);
        assert_eq!(analysis.variants[1].variant_group_id, "C");
        assert_eq!(analysis.variants[1].reason, EarlyStopReason::Inconclusive);
        assert!(analysis
            .variants
            .iter()
            .all(|v| v.threshold == DEFAULT_EARLY_STOP_THRESHOLD));
    }

    #[test]
    fn test_bayesian_analysis_without_groups() {
        let (engine, _) = engine_with(&[], &[]);
        assert!(matches!(
            engine.bayesian_analysis("exp"),
            Err(PiscesError::NoGroups(_))
        ));
    }

    #[test]
    fn test_sample_count_has_a_floor() {
        let (engine, _) = engine_with(&["A"], &[]);
        let engine = engine.with_samples(10);
        assert_eq!(engine.samples, MIN_MONTE_CARLO_SAMPLES);
    }

    #[test]
    fn test_invalid_default_threshold_is_ignored() {
        let (engine, _) = engine_with(&["A", "B"], &[]);
        let engine = engine.with_default_threshold(1.0);
        assert_eq!(engine.default_threshold(), DEFAULT_EARLY_STOP_THRESHOLD);
        assert!(engine.bayesian_analysis("exp").is_ok());

        let engine = engine.with_default_threshold(0.8);
        assert_eq!(engine.default_threshold(), 0.8);
        let engine = engine.with_default_threshold(f64::NAN);
        assert_eq!(engine.default_threshold(), 0.8);
    }
}
