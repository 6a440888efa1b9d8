//! REST handlers for traffic assignment, event intake and operational probes.

use crate::error::{blocking, ApiError};
use crate::stores::Stores;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use pisces_analytics::{EventRecorder, RecordedEvent, WinRateEngine};
use pisces_bandit::BanditEngine;
use pisces_core::config::AppConfig;
use pisces_core::store::ExperimentRepository;
use pisces_core::types::EventType;
use pisces_traffic::{Decision, RandomSource, TrafficAllocator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Maximum length of ids accepted at the boundary.
const MAX_ID_LEN: usize = 256;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn ExperimentRepository>,
    pub allocator: Arc<TrafficAllocator>,
    pub bandits: Arc<BanditEngine>,
    pub win_rates: Arc<WinRateEngine>,
    pub recorder: Arc<EventRecorder>,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    /// Wire the engines over the given stores using the config's tuning knobs.
    pub fn new(config: &AppConfig, stores: Stores) -> Self {
        let Stores {
            experiments,
            catalog,
            sticky,
            bandits: bandit_store,
            event_counts,
            event_sink,
            metadata_cache: _,
        } = stores;

        let bandits = Arc::new(
            BanditEngine::new(experiments.clone(), bandit_store)
                .with_exploration(config.bandit.ucb_exploration),
        );

        let random = config
            .traffic
            .random_seed
            .map_or(RandomSource::Entropy, RandomSource::Seeded);
        let allocator = Arc::new(
            TrafficAllocator::new(experiments.clone(), sticky, bandits.clone())
                .with_random_source(random),
        );

        let win_rates = Arc::new(
            WinRateEngine::new(experiments, event_counts)
                .with_samples(config.analysis.monte_carlo_samples)
                .with_default_threshold(config.analysis.early_stop_threshold),
        );

        let recorder = Arc::new(
            EventRecorder::new(allocator.clone(), event_sink, bandits.clone())
                .with_reward_value_threshold(config.analysis.reward_value_threshold),
        );

        Self {
            catalog,
            allocator,
            bandits,
            win_rates,
            recorder,
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        }
    }
}

/// Reject empty or oversized ids before they reach a store key.
pub(crate) fn validate_id(field: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(ApiError::bad_request(format!(
            "'{field}' must be between 1 and {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_ids(experiment_id: &str, visitor_id: &str) -> Result<(), ApiError> {
    validate_id("experiment_id", experiment_id)?;
    validate_id("visitor_id", visitor_id)
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub experiment_id: String,
    pub visitor_id: String,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub experiment_id: String,
    pub visitor_id: String,
    pub group_id: Option<String>,
    pub decision: Decision,
}

/// POST /v1/traffic/assign
pub async fn handle_assign(
    State(state): State<AppState>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<AssignResponse>, ApiError> {
    validate_ids(&request.experiment_id, &request.visitor_id)?;

    let allocator = state.allocator.clone();
    let (experiment_id, visitor_id) = (request.experiment_id.clone(), request.visitor_id.clone());
    let decision = blocking(move || allocator.decide(&experiment_id, &visitor_id)).await?;

    Ok(Json(AssignResponse {
        group_id: decision.group_id().map(str::to_string),
        experiment_id: request.experiment_id,
        visitor_id: request.visitor_id,
        decision,
    }))
}

#[derive(Debug, Serialize)]
pub struct VisitorGroupResponse {
    pub experiment_id: String,
    pub visitor_id: String,
    pub group_id: Option<String>,
}

/// GET /v1/traffic/experiments/:experiment_id/visitors/:visitor_id
pub async fn handle_visitor_group(
    State(state): State<AppState>,
    Path((experiment_id, visitor_id)): Path<(String, String)>,
) -> Result<Json<VisitorGroupResponse>, ApiError> {
    validate_ids(&experiment_id, &visitor_id)?;

    let allocator = state.allocator.clone();
    let (exp, visitor) = (experiment_id.clone(), visitor_id.clone());
    let group_id = blocking(move || allocator.get_group_for_visitor(&exp, &visitor)).await?;

    Ok(Json(VisitorGroupResponse {
        experiment_id,
        visitor_id,
        group_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct VisitorExperimentsResponse {
    pub visitor_id: String,
    pub experiments: HashMap<String, String>,
}

/// GET /v1/traffic/visitors/:visitor_id/experiments
pub async fn handle_visitor_experiments(
    State(state): State<AppState>,
    Path(visitor_id): Path<String>,
) -> Result<Json<VisitorExperimentsResponse>, ApiError> {
    validate_id("visitor_id", &visitor_id)?;

    let allocator = state.allocator.clone();
    let visitor = visitor_id.clone();
    let experiments = blocking(move || allocator.visitor_experiments(&visitor)).await?;
    Ok(Json(VisitorExperimentsResponse {
        visitor_id,
        experiments,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub experiment_id: String,
    pub visitor_id: String,
    pub event_type: String,
    #[serde(default)]
    pub value: Option<f64>,
}

/// POST /v1/events: 200 with the recorded group, 202 with `null` when the
/// visitor is not part of the experiment.
pub async fn handle_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<Option<RecordedEvent>>), ApiError> {
    validate_ids(&request.experiment_id, &request.visitor_id)?;
    let event_type: EventType = request.event_type.parse()?;

    let recorder = state.recorder.clone();
    let recorded = blocking(move || {
        recorder.record(
            &request.experiment_id,
            &request.visitor_id,
            event_type,
            request.value,
        )
    })
    .await?;

    metrics::counter!("api.events", "event_type" => event_type.as_str()).increment(1);
    let status = if recorded.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(recorded)))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: readiness probe.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live: liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}
