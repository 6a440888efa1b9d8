use crate::error::PiscesError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an experiment. Only `Running` accepts new assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Stopped,
}

/// Allocation strategy, resolved once when the experiment definition is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficStrategy {
    Random,
    Hash,
    Rule,
    ThompsonSampling,
    Ucb,
}

impl TrafficStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "RANDOM",
            Self::Hash => "HASH",
            Self::Rule => "RULE",
            Self::ThompsonSampling => "THOMPSON_SAMPLING",
            Self::Ucb => "UCB",
        }
    }

    /// Bandit-driven strategies ignore the static ratio table.
    pub fn is_bandit(&self) -> bool {
        matches!(self, Self::ThompsonSampling | Self::Ucb)
    }
}

impl fmt::Display for TrafficStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficStrategy {
    type Err = PiscesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RANDOM" => Ok(Self::Random),
            "HASH" => Ok(Self::Hash),
            "RULE" => Ok(Self::Rule),
            "THOMPSON_SAMPLING" => Ok(Self::ThompsonSampling),
            "UCB" => Ok(Self::Ucb),
            other => Err(PiscesError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Event kinds tracked by the event counter provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    View,
    Click,
    Convert,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::View, EventType::Click, EventType::Convert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "VIEW",
            Self::Click => "CLICK",
            Self::Convert => "CONVERT",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::View => 0,
            Self::Click => 1,
            Self::Convert => 2,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = PiscesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VIEW" => Ok(Self::View),
            "CLICK" => Ok(Self::Click),
            "CONVERT" => Ok(Self::Convert),
            other => Err(PiscesError::InvalidEventType(other.to_string())),
        }
    }
}

/// One experiment group (an "arm" in bandit terms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Static traffic ratio in [0, 1]; ignored by bandit strategies.
    #[serde(default)]
    pub traffic_ratio: f64,
}

/// One row of the cumulative ratio table used by RANDOM and HASH allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAllocation {
    pub group: String,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Fraction of all visitors admitted into the experiment, in [0, 1].
    pub total_traffic: f64,
    pub strategy: TrafficStrategy,
    /// Salt for the HASH/RULE bucket draw.
    #[serde(default)]
    pub hash_key: Option<String>,
    #[serde(default)]
    pub allocation: Vec<GroupAllocation>,
}

/// Experiment as published by the metadata provider. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Groups in definition order; the first one is the baseline.
    pub groups: Vec<GroupDefinition>,
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub whitelist: HashSet<String>,
    #[serde(default)]
    pub blacklist: HashSet<String>,
}

impl ExperimentDefinition {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    /// Both bounds are inclusive; a missing bound is open.
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        let started = self.start_time.map_or(true, |start| now >= start);
        let not_ended = self.end_time.map_or(true, |end| now <= end);
        started && not_ended
    }

    pub fn first_group(&self) -> Option<&GroupDefinition> {
        self.groups.first()
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.id.as_str())
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.groups.iter().any(|g| g.id == group_id)
    }
}

/// Beta posterior parameters for Thompson Sampling. Both are always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetaParameters {
    pub alpha: u64,
    pub beta: u64,
}

impl BetaParameters {
    /// Posterior under a uniform Beta(1, 1) prior.
    pub fn from_outcomes(successes: u64, failures: u64) -> Self {
        Self {
            alpha: successes + 1,
            beta: failures + 1,
        }
    }

    pub fn mean(&self) -> f64 {
        self.alpha as f64 / (self.alpha + self.beta) as f64
    }
}

impl Default for BetaParameters {
    fn default() -> Self {
        Self::from_outcomes(0, 0)
    }
}

/// UCB1 view of an arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BanditStatistics {
    pub trials: u64,
    pub successes: u64,
    pub average_reward: f64,
}

/// Raw per-arm counters as held by a bandit store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmCounters {
    pub trials: u64,
    pub successes: u64,
    pub failures: u64,
}

impl ArmCounters {
    pub fn beta_parameters(&self) -> BetaParameters {
        BetaParameters::from_outcomes(self.successes, self.failures)
    }

    pub fn average_reward(&self) -> f64 {
        if self.trials > 0 {
            self.successes as f64 / self.trials as f64
        } else {
            0.0
        }
    }

    pub fn statistics(&self) -> BanditStatistics {
        BanditStatistics {
            trials: self.trials,
            successes: self.successes,
            average_reward: self.average_reward(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarlyStopReason {
    PositiveSignificant,
    NegativeSignificant,
    Inconclusive,
}

/// Early-stop verdict for one variant against a baseline. Recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinRateResult {
    pub experiment_id: String,
    pub variant_group_id: String,
    pub baseline_group_id: String,
    pub win_rate: f64,
    pub threshold: f64,
    pub can_stop: bool,
    pub reason: EarlyStopReason,
}

/// Every non-baseline group compared against the first defined group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianAnalysis {
    pub experiment_id: String,
    pub baseline_group_id: String,
    pub variants: Vec<WinRateResult>,
}
