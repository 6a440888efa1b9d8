//! Conversion analytics: per-group event counters, the recorder that feeds
//! them (and bandit rewards) from raw events, and the Bayesian win-rate engine.

pub mod bayesian;
pub mod counters;
pub mod recorder;

pub use bayesian::WinRateEngine;
pub use counters::EventCounters;
pub use recorder::{EventRecorder, RecordedEvent};
