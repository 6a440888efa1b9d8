//! Turns raw visitor events into group counters and bandit rewards.

use pisces_bandit::BanditEngine;
use pisces_core::store::EventCounterSink;
use pisces_core::types::EventType;
use pisces_core::PiscesResult;
use pisces_traffic::TrafficAllocator;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    pub group_id: String,
    /// Counter value for this group and event type after the increment.
    pub count: u64,
    /// Bandit outcome fed by a conversion; `None` for other event types.
    pub reward: Option<bool>,
}

pub struct EventRecorder {
    allocator: Arc<TrafficAllocator>,
    counters: Arc<dyn EventCounterSink>,
    bandits: Arc<BanditEngine>,
    reward_value_threshold: Option<f64>,
}

impl EventRecorder {
    pub fn new(
        allocator: Arc<TrafficAllocator>,
        counters: Arc<dyn EventCounterSink>,
        bandits: Arc<BanditEngine>,
    ) -> Self {
        Self {
            allocator,
            counters,
            bandits,
            reward_value_threshold: None,
        }
    }

    /// Conversions count as bandit successes only when their value exceeds this.
    pub fn with_reward_value_threshold(mut self, threshold: Option<f64>) -> Self {
        self.reward_value_threshold = threshold;
        self
    }

    /// Record one event. `Ok(None)` when the visitor is not in the experiment.
    pub fn record(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        event_type: EventType,
        value: Option<f64>,
    ) -> PiscesResult<Option<RecordedEvent>> {
        let Some(group_id) = self
            .allocator
            .get_group_for_visitor(experiment_id, visitor_id)?
        else {
            debug!(experiment_id, visitor_id, %event_type, "Event for unassigned visitor ignored");
            return Ok(None);
        };

        let count = self
            .counters
            .increment(experiment_id, &group_id, event_type)?;

        let reward = match event_type {
            EventType::Convert => {
                let success = self.is_success(value);
                self.bandits
                    .update_reward(experiment_id, &group_id, success)?;
                Some(success)
            }
            EventType::View | EventType::Click => None,
        };

        debug!(
            experiment_id,
            visitor_id,
            group_id = %group_id,
            %event_type,
            count,
            "Event recorded"
        );
        Ok(Some(RecordedEvent {
            group_id,
            count,
            reward,
        }))
    }

    fn is_success(&self, value: Option<f64>) -> bool {
        match (self.reward_value_threshold, value) {
            (Some(threshold), Some(value)) => value > threshold,
            _ => true,
        }
    }
}
