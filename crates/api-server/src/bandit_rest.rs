//! Bandit REST endpoints: reward intake and per-arm inspection.

use crate::error::{blocking, ApiError};
use crate::rest::{validate_id, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use pisces_bandit::ArmReport;
use pisces_core::types::{BanditStatistics, BetaParameters};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RewardRequest {
    pub group_id: String,
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct GroupQuery {
    pub group_id: String,
}

/// POST /v1/bandit/experiments/:experiment_id/reward
pub async fn handle_reward(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Json(request): Json<RewardRequest>,
) -> Result<StatusCode, ApiError> {
    validate_id("experiment_id", &experiment_id)?;
    validate_id("group_id", &request.group_id)?;

    let bandits = state.bandits.clone();
    blocking(move || bandits.update_reward(&experiment_id, &request.group_id, request.success))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/bandit/experiments/:experiment_id/beta?group_id=
pub async fn handle_beta(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<BetaParameters>, ApiError> {
    validate_id("experiment_id", &experiment_id)?;
    validate_id("group_id", &query.group_id)?;

    let bandits = state.bandits.clone();
    let params =
        blocking(move || bandits.beta_parameters(&experiment_id, &query.group_id)).await?;
    Ok(Json(params))
}

/// GET /v1/bandit/experiments/:experiment_id/stats?group_id=
pub async fn handle_stats(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<BanditStatistics>, ApiError> {
    validate_id("experiment_id", &experiment_id)?;
    validate_id("group_id", &query.group_id)?;

    let bandits = state.bandits.clone();
    let stats = blocking(move || bandits.statistics(&experiment_id, &query.group_id)).await?;
    Ok(Json(stats))
}

/// GET /v1/bandit/experiments/:experiment_id/arms
pub async fn handle_arms(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> Result<Json<Vec<ArmReport>>, ApiError> {
    validate_id("experiment_id", &experiment_id)?;

    let bandits = state.bandits.clone();
    let reports = blocking(move || bandits.arm_reports(&experiment_id)).await?;
    Ok(Json(reports))
}
