//! Job repository for database operations
//!
//! SeaORM-backed [`JobStore`] over the `anonymize_jobs` table. Every write
//! issues a new version token and is guarded on the caller's token, so at most
//! one writer wins a race and terminal rows are never overwritten.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{
    FailureDetails, JobError, JobOutcome, JobProgress, JobRecord, JobStatus, JobStore,
    VersionToken,
};
use crate::models::anonymize_job::{self, Column, Entity as AnonymizeJob};

/// Repository for anonymize job database operations
#[derive(Debug, Clone)]
pub struct JobRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl JobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn issue_version() -> VersionToken {
        VersionToken::new(Uuid::new_v4().to_string())
    }

    /// Parses a stored row back into a record and its version token.
    fn to_outcome(model: anonymize_job::Model) -> Result<JobOutcome, JobError> {
        let corrupt = |reason: String| JobError::CorruptRecord {
            job_id: model.id,
            reason,
        };

        let status = model
            .status
            .parse::<JobStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let progress = model
            .progress
            .clone()
            .map(serde_json::from_value::<JobProgress>)
            .transpose()
            .map_err(|e| corrupt(format!("progress: {}", e)))?;
        let failure_details = model
            .failure_details
            .clone()
            .map(serde_json::from_value::<FailureDetails>)
            .transpose()
            .map_err(|e| corrupt(format!("failure details: {}", e)))?;

        Ok(JobOutcome {
            record: JobRecord {
                id: model.id,
                status,
                collection_id: model.collection_id,
                resource_type: model.resource_type,
                queued_time: model.queued_at.with_timezone(&Utc),
                start_time: model.started_at.map(|t| t.with_timezone(&Utc)),
                end_time: model.ended_at.map(|t| t.with_timezone(&Utc)),
                progress,
                failure_details,
            },
            version: VersionToken::new(model.version),
        })
    }

    fn terminal_statuses() -> Vec<&'static str> {
        JobStatus::TERMINAL.iter().map(JobStatus::as_str).collect()
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn create_job(&self, record: JobRecord) -> Result<JobOutcome, JobError> {
        let now = Utc::now().fixed_offset();
        let version = Self::issue_version();

        let job = anonymize_job::ActiveModel {
            id: Set(record.id),
            status: Set(record.status.as_str().to_string()),
            collection_id: Set(record.collection_id.clone()),
            resource_type: Set(record.resource_type.clone()),
            queued_at: Set(record.queued_time.fixed_offset()),
            started_at: Set(record.start_time.map(|t| t.fixed_offset())),
            ended_at: Set(record.end_time.map(|t| t.fixed_offset())),
            progress: Set(record.progress.as_ref().map(serde_json::to_value).transpose()?),
            failure_details: Set(record
                .failure_details
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?),
            version: Set(version.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        job.insert(&*self.db).await?;

        tracing::info!(
            job_id = %record.id,
            collection_id = %record.collection_id,
            resource_type = record.resource_type.as_deref().unwrap_or("*"),
            "Anonymize job created"
        );

        Ok(JobOutcome { record, version })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobOutcome>, JobError> {
        AnonymizeJob::find_by_id(job_id)
            .one(&*self.db)
            .await?
            .map(Self::to_outcome)
            .transpose()
    }

    async fn update_job(
        &self,
        record: &JobRecord,
        version: &VersionToken,
    ) -> Result<JobOutcome, JobError> {
        let next_version = Self::issue_version();

        let changes = anonymize_job::ActiveModel {
            status: Set(record.status.as_str().to_string()),
            resource_type: Set(record.resource_type.clone()),
            started_at: Set(record.start_time.map(|t| t.fixed_offset())),
            ended_at: Set(record.end_time.map(|t| t.fixed_offset())),
            progress: Set(record.progress.as_ref().map(serde_json::to_value).transpose()?),
            failure_details: Set(record
                .failure_details
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?),
            version: Set(next_version.as_str().to_string()),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        let result = AnonymizeJob::update_many()
            .set(changes)
            .filter(Column::Id.eq(record.id))
            .filter(Column::Version.eq(version.as_str()))
            .filter(Column::Status.is_not_in(Self::terminal_statuses()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            let exists = AnonymizeJob::find_by_id(record.id)
                .one(&*self.db)
                .await?
                .is_some();
            return Err(if exists {
                JobError::Conflict { job_id: record.id }
            } else {
                JobError::JobNotFound { job_id: record.id }
            });
        }

        debug!(job_id = %record.id, status = %record.status, "Job record updated");

        Ok(JobOutcome {
            record: record.clone(),
            version: next_version,
        })
    }

    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<JobOutcome>, JobError> {
        let mut runnable = Condition::any().add(Column::Status.eq(JobStatus::Queued.as_str()));

        let stale_before: Option<DateTime<Utc>> = TimeDelta::from_std(heartbeat_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout));
        if let Some(stale_before) = stale_before {
            runnable = runnable.add(
                Condition::all()
                    .add(Column::Status.eq(JobStatus::Running.as_str()))
                    .add(Column::UpdatedAt.lt(stale_before.fixed_offset())),
            );
        }

        let candidates = AnonymizeJob::find()
            .filter(runnable)
            .order_by_asc(Column::QueuedAt)
            .limit(max_jobs as u64)
            .all(&*self.db)
            .await?;

        let mut acquired = Vec::with_capacity(candidates.len());
        for model in candidates {
            let job_id = model.id;
            let JobOutcome {
                mut record,
                version,
            } = match Self::to_outcome(model) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%job_id, error = %e, "Skipping unreadable job");
                    continue;
                }
            };

            if record.status == JobStatus::Running {
                debug!(%job_id, "Reclaiming job with stale heartbeat");
            }
            record.status = JobStatus::Running;

            match self.update_job(&record, &version).await {
                Ok(outcome) => acquired.push(outcome),
                Err(JobError::Conflict { .. }) => {
                    debug!(%job_id, "Job claimed by another worker");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(acquired)
    }
}
