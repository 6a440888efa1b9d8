//! Bayesian analysis endpoints.

use crate::error::{blocking, ApiError};
use crate::rest::{validate_id, AppState};
use axum::extract::{Path, Query, State};
use axum::Json;
use pisces_core::types::{BayesianAnalysis, WinRateResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct WinRateQuery {
    pub variant: String,
    pub baseline: String,
}

fn validate_pair(experiment_id: &str, variant: &str, baseline: &str) -> Result<(), ApiError> {
    validate_id("experiment_id", experiment_id)?;
    validate_id("variant", variant)?;
    validate_id("baseline", baseline)
}

#[derive(Debug, Deserialize)]
pub struct EarlyStopQuery {
    pub variant: String,
    pub baseline: String,
    /// Falls back to the configured default threshold.
    pub threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct WinRateResponse {
    pub experiment_id: String,
    pub variant_group_id: String,
    pub baseline_group_id: String,
    pub win_rate: f64,
}

/// GET /v1/analysis/experiments/:experiment_id/win-rate?variant=&baseline=
pub async fn handle_win_rate(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(query): Query<WinRateQuery>,
) -> Result<Json<WinRateResponse>, ApiError> {
    validate_pair(&experiment_id, &query.variant, &query.baseline)?;

    let engine = state.win_rates.clone();
    let (exp, variant, baseline) = (
        experiment_id.clone(),
        query.variant.clone(),
        query.baseline.clone(),
    );
    let win_rate =
        blocking(move || engine.calculate_win_rate(&exp, &variant, &baseline)).await?;

    Ok(Json(WinRateResponse {
        experiment_id,
        variant_group_id: query.variant,
        baseline_group_id: query.baseline,
        win_rate,
    }))
}

/// GET /v1/analysis/experiments/:experiment_id/early-stop?variant=&baseline=&threshold=
pub async fn handle_early_stop(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(query): Query<EarlyStopQuery>,
) -> Result<Json<WinRateResult>, ApiError> {
    validate_pair(&experiment_id, &query.variant, &query.baseline)?;

    let engine = state.win_rates.clone();
    let threshold = query
        .threshold
        .unwrap_or_else(|| engine.default_threshold());
    let result = blocking(move || {
        engine.should_early_stop(&experiment_id, &query.variant, &query.baseline, threshold)
    })
    .await?;
    Ok(Json(result))
}

/// GET /v1/analysis/experiments/:experiment_id/bayesian
pub async fn handle_bayesian(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> Result<Json<BayesianAnalysis>, ApiError> {
    validate_id("experiment_id", &experiment_id)?;

    let engine = state.win_rates.clone();
    let analysis = blocking(move || engine.bayesian_analysis(&experiment_id)).await?;
    Ok(Json(analysis))
}
