//! Admin endpoints for experiment definitions. Changes apply to the next
//! decision; existing sticky assignments are never touched.

use crate::error::{blocking, ApiError};
use crate::rest::{validate_id, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use pisces_core::types::ExperimentDefinition;
use pisces_core::PiscesError;
use tracing::info;

/// GET /v1/experiments/:experiment_id
pub async fn handle_get(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> Result<Json<ExperimentDefinition>, ApiError> {
    validate_id("experiment_id", &experiment_id)?;

    let catalog = state.catalog.clone();
    let definition = blocking(move || {
        catalog
            .get(&experiment_id)?
            .ok_or(PiscesError::ExperimentNotFound(experiment_id))
    })
    .await?;
    Ok(Json(definition.as_ref().clone()))
}

/// PUT /v1/experiments/:experiment_id: 201 when created, 200 when replaced.
pub async fn handle_put(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Json(definition): Json<ExperimentDefinition>,
) -> Result<(StatusCode, Json<ExperimentDefinition>), ApiError> {
    validate_id("experiment_id", &experiment_id)?;
    if definition.id != experiment_id {
        return Err(ApiError::bad_request(format!(
            "body id '{}' does not match path id '{experiment_id}'",
            definition.id
        )));
    }

    let catalog = state.catalog.clone();
    let saved = definition.clone();
    let existed = blocking(move || {
        let existed = catalog.get(&saved.id)?.is_some();
        catalog.save(saved)?;
        Ok(existed)
    })
    .await?;

    info!(
        experiment_id = %definition.id,
        status = ?definition.status,
        created = !existed,
        "Experiment definition saved"
    );
    metrics::counter!("api.experiments.saved").increment(1);

    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(definition)))
}

/// DELETE /v1/experiments/:experiment_id
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_id("experiment_id", &experiment_id)?;

    let catalog = state.catalog.clone();
    let id = experiment_id.clone();
    let removed = blocking(move || catalog.delete(&id)).await?;
    if !removed {
        return Err(PiscesError::ExperimentNotFound(experiment_id).into());
    }

    info!(experiment_id = %experiment_id, "Experiment definition deleted");
    Ok(StatusCode::NO_CONTENT)
}
