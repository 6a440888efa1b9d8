//! Multi-armed bandit engine: Thompson Sampling and UCB1 over the groups of
//! an experiment, backed by a shared `BanditStore`.

use pisces_core::sampling::sample_posterior;
use pisces_core::store::{BanditStore, ExperimentProvider};
use pisces_core::types::{
    BanditStatistics, BetaParameters, ExperimentDefinition, TrafficStrategy,
};
use pisces_core::{PiscesError, PiscesResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// UCB1 exploration constant `c` in `mean + c * sqrt(ln(t) / n)`.
pub const DEFAULT_EXPLORATION: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanditAlgorithm {
    ThompsonSampling,
    Ucb1,
}

impl BanditAlgorithm {
    pub fn from_strategy(strategy: TrafficStrategy) -> Option<Self> {
        match strategy {
            TrafficStrategy::ThompsonSampling => Some(Self::ThompsonSampling),
            TrafficStrategy::Ucb => Some(Self::Ucb1),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::ThompsonSampling => "thompson_sampling",
            Self::Ucb1 => "ucb1",
        }
    }
}

/// Per-arm snapshot combining both algorithms' views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmReport {
    pub group_id: String,
    pub trials: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_reward: f64,
    pub alpha: u64,
    pub beta: u64,
    pub posterior_mean: f64,
    pub traffic_allocation: f64,
}

pub struct BanditEngine {
    experiments: Arc<dyn ExperimentProvider>,
    store: Arc<dyn BanditStore>,
    exploration: f64,
}

impl BanditEngine {
    pub fn new(experiments: Arc<dyn ExperimentProvider>, store: Arc<dyn BanditStore>) -> Self {
        Self {
            experiments,
            store,
            exploration: DEFAULT_EXPLORATION,
        }
    }

    pub fn with_exploration(mut self, exploration: f64) -> Self {
        self.exploration = exploration;
        self
    }

    fn definition(&self, experiment_id: &str) -> PiscesResult<Arc<ExperimentDefinition>> {
        self.experiments
            .get(experiment_id)?
            .ok_or_else(|| PiscesError::ExperimentNotFound(experiment_id.to_string()))
    }

    /// Select an arm for the experiment. `None` when it has no groups.
    pub fn select_arm(
        &self,
        experiment_id: &str,
        algorithm: BanditAlgorithm,
    ) -> PiscesResult<Option<String>> {
        let definition = self.definition(experiment_id)?;
        self.select_for(&definition, algorithm)
    }

    /// Select an arm for an already-loaded definition.
    pub fn select_for(
        &self,
        definition: &ExperimentDefinition,
        algorithm: BanditAlgorithm,
    ) -> PiscesResult<Option<String>> {
        let selected = match algorithm {
            BanditAlgorithm::ThompsonSampling => {
                self.thompson_sampling(definition, &mut rand::thread_rng())?
            }
            BanditAlgorithm::Ucb1 => self.ucb1(definition)?,
        };
        if selected.is_some() {
            metrics::counter!("bandit.select", "algorithm" => algorithm.label()).increment(1);
        }
        Ok(selected)
    }

    /// Sample once from every arm's Beta posterior and take the largest sample.
    pub fn thompson_sampling<R: Rng + ?Sized>(
        &self,
        definition: &ExperimentDefinition,
        rng: &mut R,
    ) -> PiscesResult<Option<String>> {
        let mut best_sample = f64::NEG_INFINITY;
        let mut best_group = None;

        for group_id in definition.group_ids() {
            let params = self.store.arm(&definition.id, group_id)?.beta_parameters();
            let sample = sample_posterior(rng, params);
            if sample > best_sample {
                best_sample = sample;
                best_group = Some(group_id);
            }
        }

        debug!(
            experiment_id = %definition.id,
            group_id = ?best_group,
            sample = best_sample,
            "Thompson Sampling selected arm"
        );
        Ok(best_group.map(str::to_string))
    }

    /// UCB1 with mandatory exploration: any untried arm is taken first, in
    /// definition order. The chosen arm's trial counter and the experiment's
    /// total are incremented before returning.
    pub fn ucb1(&self, definition: &ExperimentDefinition) -> PiscesResult<Option<String>> {
        let experiment_id = definition.id.as_str();
        let t = self.store.total_trials(experiment_id)? + 1;
        let log_t = (t as f64).ln();

        let mut best_score = f64::NEG_INFINITY;
        let mut best_group = None;

        for group_id in definition.group_ids() {
            let counters = self.store.arm(experiment_id, group_id)?;
            if counters.trials == 0 {
                best_group = Some(group_id);
                best_score = f64::INFINITY;
                break;
            }

            let score = counters.average_reward()
                + self.exploration * (log_t / counters.trials as f64).sqrt();
            if score > best_score {
                best_score = score;
                best_group = Some(group_id);
            }
        }

        let Some(group_id) = best_group else {
            return Ok(None);
        };
        self.store.record_trial(experiment_id, group_id)?;

        debug!(
            experiment_id,
            group_id,
            score = best_score,
            t,
            "UCB1 selected arm"
        );
        Ok(Some(group_id.to_string()))
    }

    /// Record a terminal conversion outcome for an arm.
    pub fn update_reward(
        &self,
        experiment_id: &str,
        group_id: &str,
        success: bool,
    ) -> PiscesResult<()> {
        self.store.record_reward(experiment_id, group_id, success)?;
        metrics::counter!(
            "bandit.reward",
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
        debug!(experiment_id, group_id, success, "Bandit reward recorded");
        Ok(())
    }

    pub fn beta_parameters(
        &self,
        experiment_id: &str,
        group_id: &str,
    ) -> PiscesResult<BetaParameters> {
        Ok(self.store.arm(experiment_id, group_id)?.beta_parameters())
    }

    pub fn statistics(&self, experiment_id: &str, group_id: &str) -> PiscesResult<BanditStatistics> {
        Ok(self.store.arm(experiment_id, group_id)?.statistics())
    }

    /// Per-arm report in definition order.
    pub fn arm_reports(&self, experiment_id: &str) -> PiscesResult<Vec<ArmReport>> {
        let definition = self.definition(experiment_id)?;
        let arms = definition
            .group_ids()
            .map(|group_id| Ok((group_id, self.store.arm(experiment_id, group_id)?)))
            .collect::<PiscesResult<Vec<_>>>()?;

        let total_trials: u64 = arms.iter().map(|(_, counters)| counters.trials).sum();
        let uniform = 1.0 / arms.len().max(1) as f64;

        Ok(arms
            .into_iter()
            .map(|(group_id, counters)| {
                let params = counters.beta_parameters();
                ArmReport {
                    group_id: group_id.to_string(),
                    trials: counters.trials,
                    successes: counters.successes,
                    failures: counters.failures,
                    average_reward: counters.average_reward(),
                    alpha: params.alpha,
                    beta: params.beta,
                    posterior_mean: params.mean(),
                    traffic_allocation: if total_trials > 0 {
                        counters.trials as f64 / total_trials as f64
                    } else {
                        uniform
                    },
                }
            })
            .collect())
    }
}
