//! Job record, lifecycle status and resumable progress.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Job lifecycle status. `Completed`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownJobStatus(pub String);

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

/// Where a job is in its scan of the source collection.
///
/// `page` counts pages that returned a continuation token. It never moves
/// backwards and is left unchanged when the scan is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobProgress {
    #[default]
    NotStarted,
    InProgress {
        continuation_token: String,
        page: u32,
    },
    Exhausted {
        page: u32,
    },
}

impl JobProgress {
    pub fn page(&self) -> u32 {
        match self {
            JobProgress::NotStarted => 0,
            JobProgress::InProgress { page, .. } | JobProgress::Exhausted { page } => *page,
        }
    }

    pub fn continuation_token(&self) -> Option<&str> {
        match self {
            JobProgress::InProgress {
                continuation_token, ..
            } => Some(continuation_token),
            _ => None,
        }
    }

    pub fn has_more(&self) -> bool {
        !matches!(self, JobProgress::Exhausted { .. })
    }

    /// Records a page that came back with a continuation token.
    pub fn advance(&mut self, continuation_token: String) {
        let page = self.page() + 1;
        *self = JobProgress::InProgress {
            continuation_token,
            page,
        };
    }

    /// Records the final page of the scan.
    pub fn exhaust(&mut self) {
        let page = self.page();
        *self = JobProgress::Exhausted { page };
    }
}

/// Reason stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FailureDetails {
    #[schema(example = "Unknown error")]
    pub message: String,
    #[schema(example = 500)]
    pub status_code: u16,
}

impl FailureDetails {
    pub fn new<S: Into<String>>(message: S, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }
}

/// Opaque optimistic concurrency token issued by a job store.
///
/// Only stores create tokens. Callers hand back the last token they received
/// and otherwise never inspect it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable view of a persisted anonymize job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub collection_id: String,
    /// `None` exports every resource type.
    pub resource_type: Option<String>,
    /// Enqueue time; the scan only sees resources updated at or before it.
    pub queued_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` until the job first runs.
    pub progress: Option<JobProgress>,
    pub failure_details: Option<FailureDetails>,
}

impl JobRecord {
    pub fn new<S: Into<String>>(
        collection_id: S,
        resource_type: Option<String>,
        queued_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            collection_id: collection_id.into(),
            resource_type,
            queued_time,
            start_time: None,
            end_time: None,
            progress: None,
            failure_details: None,
        }
    }

    pub fn page(&self) -> u32 {
        self.progress.as_ref().map(JobProgress::page).unwrap_or(0)
    }

    /// Moves the record to a terminal status.
    pub fn finish(
        &mut self,
        status: JobStatus,
        failure_details: Option<FailureDetails>,
        at: DateTime<Utc>,
    ) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.failure_details = failure_details;
        self.end_time = Some(at);
    }
}

/// A job record together with the version token it was read or written at.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub record: JobRecord,
    pub version: VersionToken,
}
