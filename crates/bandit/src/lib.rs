//! Multi-armed bandit engine: Thompson Sampling and UCB1 arm selection over
//! shared per-arm counters, plus reward updates fed by conversion events.

pub mod bandits;

pub use bandits::{ArmReport, BanditAlgorithm, BanditEngine};
