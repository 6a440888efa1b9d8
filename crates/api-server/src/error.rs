//! Maps engine errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pisces_core::{PiscesError, PiscesResult};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(PiscesError),
    /// Request rejected at the boundary before reaching an engine.
    BadRequest(String),
}

impl From<PiscesError> for ApiError {
    fn from(err: PiscesError) -> Self {
        Self::Engine(err)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(PiscesError::ExperimentNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Engine(err) if err.is_invalid_input() => StatusCode::BAD_REQUEST,
            Self::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::Engine(err) => match err {
                PiscesError::ExperimentNotFound(_) => "experiment_not_found",
                PiscesError::InvalidStrategy(_) => "invalid_strategy",
                PiscesError::InvalidEventType(_) => "invalid_event_type",
                PiscesError::InvalidThreshold(_) => "invalid_threshold",
                PiscesError::NoGroups(_) => "no_groups",
                PiscesError::Storage(_) => "storage_error",
                _ => "internal_error",
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            Self::Engine(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self.message(), "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            warn!(error = %self.message(), "Request rejected");
            metrics::counter!("api.validation_errors").increment(1);
            self.message()
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Run a store-touching engine call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> PiscesResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Engine(PiscesError::Internal(anyhow::Error::new(e))))?
        .map_err(ApiError::Engine)
}
