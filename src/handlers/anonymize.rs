//! # Anonymize API Handlers
//!
//! Endpoints for enqueueing de-identified export jobs and following them.

use std::sync::LazyLock;

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Json,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::anonymizer::AnonymizerConfiguration;
use crate::error::{ApiError, not_found, validation_error};
use crate::jobs::{FailureDetails, JobOutcome, JobRecord, JobStatus};
use crate::server::AppState;

static COLLECTION_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid regex"));

static RESOURCE_TYPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z]{0,63}$").expect("valid regex"));

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CreateJobQuery {
    /// Restrict the export to one resource type, e.g. `Patient`
    pub resource_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateJobResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: Uuid,
}

/// Job status as reported to clients
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Destination collection
    #[schema(example = "deid-2024")]
    pub collection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Pages processed at the last checkpoint
    pub page: u32,
    pub queued_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<FailureDetails>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            page: record.page(),
            collection_id: record.collection_id,
            resource_type: record.resource_type,
            queued_time: record.queued_time,
            start_time: record.start_time,
            end_time: record.end_time,
            failure_details: record.failure_details,
        }
    }
}

pub fn job_location(job_id: Uuid) -> String {
    format!("/anonymize/jobs/{}", job_id)
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        validation_error(
            "Invalid job id",
            json!({ "job_id": "must be a UUID" }),
        )
    })
}

fn validate_target(
    state: &AppState,
    collection_id: &str,
    resource_type: Option<&str>,
) -> Result<(), ApiError> {
    if !COLLECTION_ID_PATTERN.is_match(collection_id) {
        return Err(validation_error(
            "Invalid collection id",
            json!({ "collection_id": "1-64 characters: letters, digits, '-' or '_'" }),
        ));
    }

    if collection_id == state.config.source_collection_id {
        return Err(validation_error(
            "Invalid collection id",
            json!({ "collection_id": "cannot export into the source collection" }),
        ));
    }

    if let Some(resource_type) = resource_type
        && !RESOURCE_TYPE_PATTERN.is_match(resource_type)
    {
        return Err(validation_error(
            "Invalid resource type",
            json!({ "resource_type": "expected a resource type name such as 'Patient'" }),
        ));
    }

    Ok(())
}

/// Enqueue a de-identified export into `collection_id`
///
/// The configuration is stored before the job is created. A collection keeps
/// the first configuration it was given; later bodies for the same collection
/// do not replace it.
#[utoipa::path(
    post,
    path = "/anonymize/{collection_id}",
    params(
        ("collection_id" = String, Path, description = "Destination collection"),
        CreateJobQuery,
    ),
    request_body = AnonymizerConfiguration,
    responses(
        (status = 202, description = "Job accepted", body = CreateJobResponse,
            headers(("Content-Location" = String, description = "Job status URL"))),
        (status = 400, description = "Invalid collection, resource type or configuration", body = ApiError),
        (status = 503, description = "Store unavailable", body = ApiError)
    ),
    tag = "anonymize"
)]
pub async fn create_anonymize_job(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    Query(query): Query<CreateJobQuery>,
    payload: Result<Json<AnonymizerConfiguration>, JsonRejection>,
) -> Result<(StatusCode, HeaderMap, Json<CreateJobResponse>), ApiError> {
    let Json(configuration) = payload?;
    validate_target(&state, &collection_id, query.resource_type.as_deref())?;

    configuration.validate().map_err(|e| {
        validation_error(
            "Invalid anonymization configuration",
            json!({ "configuration": e.to_string() }),
        )
    })?;

    state
        .configuration_store
        .create_configuration(&configuration, &collection_id)
        .await?;

    let JobOutcome { record, .. } = state
        .job_store
        .create_job(JobRecord::new(
            collection_id,
            query.resource_type,
            Utc::now(),
        ))
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&job_location(record.id)) {
        headers.insert(header::CONTENT_LOCATION, location);
    }

    Ok((
        StatusCode::ACCEPTED,
        headers,
        Json(CreateJobResponse { job_id: record.id }),
    ))
}

/// Get the status of an anonymize job
#[utoipa::path(
    get,
    path = "/anonymize/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "anonymize"
)]
pub async fn get_anonymize_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;

    let outcome = state
        .job_store
        .get_job(job_id)
        .await?
        .ok_or_else(|| not_found(&format!("Job {} not found", job_id)))?;

    Ok(Json(outcome.record.into()))
}

/// Cancel a queued or running anonymize job
///
/// A running job notices the cancellation when it next writes progress and
/// stops without overwriting the canceled status.
#[utoipa::path(
    delete,
    path = "/anonymize/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Job canceled", body = JobStatusResponse),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 409, description = "Job already finished or concurrently modified", body = ApiError)
    ),
    tag = "anonymize"
)]
pub async fn cancel_anonymize_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<JobStatusResponse>), ApiError> {
    let job_id = parse_job_id(&job_id)?;

    let JobOutcome {
        mut record,
        version,
    } = state
        .job_store
        .get_job(job_id)
        .await?
        .ok_or_else(|| not_found(&format!("Job {} not found", job_id)))?;

    if record.status.is_terminal() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "CONFLICT",
            &format!("Job {} is already {}", job_id, record.status),
        ));
    }

    record.finish(JobStatus::Canceled, None, Utc::now());
    let outcome = state.job_store.update_job(&record, &version).await?;

    tracing::info!(%job_id, "Anonymize job canceled");

    Ok((StatusCode::ACCEPTED, Json(outcome.record.into())))
}
