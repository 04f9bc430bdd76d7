//! # API Handlers
//!
//! HTTP endpoint handlers for the anonymizer service.

use axum::{extract::State, http::StatusCode, response::Json};

use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod anonymize;

pub use anonymize::{cancel_anonymize_job, create_anonymize_job, get_anonymize_job};

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness of the database connection
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 204, description = "Database reachable"),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn health(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    crate::db::health_check(&state.db).await.map_err(|e| {
        tracing::warn!(error = %e, "Health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database service unavailable",
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests;
