//! Collaborator interfaces used by the anonymize job.
//!
//! Each trait is a seam: the service wires SeaORM-backed implementations,
//! tests wire in-memory doubles.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::JobError;
use super::record::{JobOutcome, JobRecord, VersionToken};

/// One extracted search index value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexEntry {
    pub path: String,
    pub value: String,
}

/// A stored resource plus the metadata that travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceWrapper {
    pub resource_id: String,
    pub resource_type: String,
    pub version: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub raw_resource: serde_json::Value,
    pub search_indices: Vec<SearchIndexEntry>,
}

/// A page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub results: Vec<ResourceWrapper>,
    /// Present while more pages remain.
    pub continuation_token: Option<String>,
}

/// Write semantics for [`ResourceStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Require the stored version to match; `None` writes unconditionally.
    pub expected_version: Option<String>,
    pub allow_create: bool,
    pub keep_history: bool,
}

impl UpsertOptions {
    /// Unconditional create-or-replace that keeps prior versions.
    pub fn export() -> Self {
        Self {
            expected_version: None,
            allow_create: true,
            keep_history: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub resource: ResourceWrapper,
    pub outcome: SaveOutcome,
}

/// Paged scan over the source collection.
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Runs a search. `resource_type` of `None` searches every type.
    async fn search(
        &self,
        resource_type: Option<&str>,
        query_parameters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SearchResult, JobError>;
}

/// Destination store for de-identified copies.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn upsert(
        &self,
        resource: ResourceWrapper,
        options: UpsertOptions,
        collection_id: &str,
    ) -> Result<UpsertOutcome, JobError>;

    async fn get(
        &self,
        resource_type: &str,
        resource_id: &str,
        collection_id: &str,
    ) -> Result<Option<ResourceWrapper>, JobError>;
}

/// Versioned persistence for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, record: JobRecord) -> Result<JobOutcome, JobError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobOutcome>, JobError>;

    /// Writes `record` if the stored version still equals `version`.
    ///
    /// Fails with [`JobError::Conflict`] when the version moved on or the
    /// stored job is already terminal. Returns the freshly issued token.
    async fn update_job(
        &self,
        record: &JobRecord,
        version: &VersionToken,
    ) -> Result<JobOutcome, JobError>;

    /// Claims up to `max_jobs` runnable jobs and marks them running.
    ///
    /// Runnable means queued, or running without a write for longer than
    /// `heartbeat_timeout`.
    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<JobOutcome>, JobError>;
}
