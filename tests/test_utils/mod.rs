//! Test utilities shared by the integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied and
//! in-memory doubles for every collaborator of the anonymize job.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anonymizer::anonymizer::{
    AnonymizationMethod, AnonymizerConfiguration, ConfigurationStore, PathRule,
};
use anonymizer::config::AnonymizeJobConfig;
use anonymizer::jobs::{
    JobError, JobOutcome, JobRecord, JobStatus, JobStore, ResourceStore, ResourceWrapper,
    SaveOutcome, SearchResult, SearchService, UpsertOptions, UpsertOutcome, VersionToken,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Job settings with a small page size and a fast poll loop.
pub fn job_config(pages_per_commit: u32) -> AnonymizeJobConfig {
    AnonymizeJobConfig {
        max_resources_per_query: 3,
        pages_per_commit,
        polling_frequency_seconds: 1,
        polling_jitter_factor: 0.0,
        ..AnonymizeJobConfig::default()
    }
}

pub fn patient(resource_id: &str) -> ResourceWrapper {
    ResourceWrapper {
        resource_id: resource_id.to_string(),
        resource_type: "Patient".to_string(),
        version: Some("1".to_string()),
        last_modified: Utc::now(),
        raw_resource: json!({
            "resourceType": "Patient",
            "id": resource_id,
            "name": [{ "family": "Doe", "given": ["Jane"] }],
            "gender": "female",
            "birthDate": "1980-04-12"
        }),
        search_indices: Vec::new(),
    }
}

/// Redacts patient names and substitutes gender.
pub fn redact_names() -> AnonymizerConfiguration {
    AnonymizerConfiguration {
        path_rules: vec![
            PathRule {
                path: "Patient.name".to_string(),
                method: AnonymizationMethod::Redact,
                replace_with: None,
            },
            PathRule {
                path: "gender".to_string(),
                method: AnonymizationMethod::Substitute,
                replace_with: Some(json!("unknown")),
            },
        ],
        ..AnonymizerConfiguration::default()
    }
}

/// Versioned in-memory job store that records every successful update.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, (JobRecord, VersionToken)>>,
    writes: Mutex<Vec<JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `record` directly and returns its token.
    pub fn seed(&self, record: JobRecord) -> VersionToken {
        let version = VersionToken::new(Uuid::new_v4().to_string());
        self.jobs
            .lock()
            .unwrap()
            .insert(record.id, (record, version.clone()));
        version
    }

    /// Simulates a write by another process.
    pub fn touch(&self, job_id: Uuid) {
        if let Some((_, version)) = self.jobs.lock().unwrap().get_mut(&job_id) {
            *version = VersionToken::new(Uuid::new_v4().to_string());
        }
    }

    pub fn stored(&self, job_id: Uuid) -> JobRecord {
        self.jobs.lock().unwrap()[&job_id].0.clone()
    }

    pub fn writes(&self) -> Vec<JobRecord> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, record: JobRecord) -> Result<JobOutcome, JobError> {
        let version = self.seed(record.clone());
        Ok(JobOutcome { record, version })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobOutcome>, JobError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|(record, version)| JobOutcome {
                record: record.clone(),
                version: version.clone(),
            }))
    }

    async fn update_job(
        &self,
        record: &JobRecord,
        version: &VersionToken,
    ) -> Result<JobOutcome, JobError> {
        let mut jobs = self.jobs.lock().unwrap();
        let (stored, stored_version) = jobs
            .get_mut(&record.id)
            .ok_or(JobError::JobNotFound { job_id: record.id })?;

        if stored_version != version || stored.status.is_terminal() {
            return Err(JobError::Conflict { job_id: record.id });
        }

        *stored = record.clone();
        *stored_version = VersionToken::new(Uuid::new_v4().to_string());
        self.writes.lock().unwrap().push(record.clone());

        Ok(JobOutcome {
            record: record.clone(),
            version: stored_version.clone(),
        })
    }

    async fn acquire_jobs(
        &self,
        max_jobs: usize,
        _heartbeat_timeout: Duration,
    ) -> Result<Vec<JobOutcome>, JobError> {
        let queued: Vec<JobOutcome> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|(record, _)| record.status == JobStatus::Queued)
            .take(max_jobs)
            .map(|(record, version)| JobOutcome {
                record: record.clone(),
                version: version.clone(),
            })
            .collect();

        let mut acquired = Vec::new();
        for JobOutcome { mut record, version } in queued {
            record.status = JobStatus::Running;
            acquired.push(self.update_job(&record, &version).await?);
        }
        Ok(acquired)
    }
}

pub type PageHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Serves a fixed sequence of pages. Page `n` is requested with token
/// `token-n`; the last page carries no token.
pub struct ScriptedSearch {
    pages: Vec<Vec<ResourceWrapper>>,
    calls: Mutex<Vec<Vec<(String, String)>>>,
    resource_types: Mutex<Vec<Option<String>>>,
    on_page: Option<PageHook>,
}

impl ScriptedSearch {
    /// `page_count` pages of `per_page` patients with ids `p{page}-{i}`.
    pub fn with_pages(page_count: usize, per_page: usize) -> Self {
        let pages = (0..page_count)
            .map(|page| {
                (0..per_page)
                    .map(|i| patient(&format!("p{}-{}", page, i)))
                    .collect()
            })
            .collect();
        Self {
            pages,
            calls: Mutex::new(Vec::new()),
            resource_types: Mutex::new(Vec::new()),
            on_page: None,
        }
    }

    /// Runs `hook` with the zero-based page index before serving each page.
    pub fn on_page(mut self, hook: PageHook) -> Self {
        self.on_page = Some(hook);
        self
    }

    pub fn calls(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn resource_types(&self) -> Vec<Option<String>> {
        self.resource_types.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchService for ScriptedSearch {
    async fn search(
        &self,
        resource_type: Option<&str>,
        query_parameters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SearchResult, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.calls.lock().unwrap().push(query_parameters.to_vec());
        self.resource_types
            .lock()
            .unwrap()
            .push(resource_type.map(str::to_owned));

        let index = query_parameters
            .iter()
            .find(|(name, _)| name == "ct")
            .map(|(_, token)| {
                token
                    .strip_prefix("token-")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| JobError::InvalidContinuationToken(token.clone()))
            })
            .transpose()?
            .unwrap_or(0);

        if let Some(hook) = &self.on_page {
            hook(index);
        }

        let results = self.pages.get(index).cloned().unwrap_or_default();
        let continuation_token =
            (index + 1 < self.pages.len()).then(|| format!("token-{}", index + 1));

        Ok(SearchResult {
            results,
            continuation_token,
        })
    }
}

/// Serves pages from `inner` but holds every search for `held_type` until
/// [`GatedSearch::open`] is called or the caller cancels.
pub struct GatedSearch {
    inner: ScriptedSearch,
    held_type: String,
    gate: tokio::sync::watch::Sender<bool>,
    held: AtomicUsize,
}

impl GatedSearch {
    pub fn new(inner: ScriptedSearch, held_type: &str) -> Self {
        Self {
            inner,
            held_type: held_type.to_string(),
            gate: tokio::sync::watch::Sender::new(false),
            held: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Number of searches currently waiting at the gate.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchService for GatedSearch {
    async fn search(
        &self,
        resource_type: Option<&str>,
        query_parameters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SearchResult, JobError> {
        if resource_type == Some(self.held_type.as_str()) {
            let mut gate = self.gate.subscribe();
            self.held.fetch_add(1, Ordering::SeqCst);
            let opened = tokio::select! {
                opened = gate.wait_for(|open| *open) => opened.is_ok(),
                _ = cancel.cancelled() => false,
            };
            self.held.fetch_sub(1, Ordering::SeqCst);
            if !opened {
                return Err(JobError::Cancelled);
            }
        }
        self.inner
            .search(resource_type, query_parameters, cancel)
            .await
    }
}

#[derive(Debug, Clone)]
pub enum StoreFailure {
    Destination { message: String, status_code: u16 },
    Unexpected,
}

/// Records upserts; optionally fails when a given resource id is written.
#[derive(Default)]
pub struct RecordingResourceStore {
    upserts: Mutex<Vec<(String, ResourceWrapper)>>,
    fail_on: Option<(String, StoreFailure)>,
}

impl RecordingResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(resource_id: &str, failure: StoreFailure) -> Self {
        Self {
            upserts: Mutex::new(Vec::new()),
            fail_on: Some((resource_id.to_string(), failure)),
        }
    }

    pub fn upserts(&self) -> Vec<(String, ResourceWrapper)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn upserted_ids(&self) -> HashSet<String> {
        self.upserts()
            .into_iter()
            .map(|(_, resource)| resource.resource_id)
            .collect()
    }
}

#[async_trait]
impl ResourceStore for RecordingResourceStore {
    async fn upsert(
        &self,
        resource: ResourceWrapper,
        _options: UpsertOptions,
        collection_id: &str,
    ) -> Result<UpsertOutcome, JobError> {
        if let Some((id, failure)) = &self.fail_on
            && *id == resource.resource_id
        {
            return Err(match failure {
                StoreFailure::Destination {
                    message,
                    status_code,
                } => JobError::destination(message.clone(), *status_code),
                StoreFailure::Unexpected => JobError::Unexpected("disk full".to_string()),
            });
        }

        self.upserts
            .lock()
            .unwrap()
            .push((collection_id.to_string(), resource.clone()));
        Ok(UpsertOutcome {
            resource,
            outcome: SaveOutcome::Created,
        })
    }

    async fn get(
        &self,
        resource_type: &str,
        resource_id: &str,
        collection_id: &str,
    ) -> Result<Option<ResourceWrapper>, JobError> {
        Ok(self
            .upserts()
            .into_iter()
            .rev()
            .find(|(collection, r)| {
                collection == collection_id
                    && r.resource_type == resource_type
                    && r.resource_id == resource_id
            })
            .map(|(_, r)| r))
    }
}

/// In-memory configuration store counting lookups.
#[derive(Default)]
pub struct InMemoryConfigurationStore {
    configurations: Mutex<HashMap<String, AnonymizerConfiguration>>,
    initialized: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
}

impl InMemoryConfigurationStore {
    pub fn with(collection_id: &str, configuration: AnonymizerConfiguration) -> Arc<Self> {
        let store = Self::default();
        store
            .configurations
            .lock()
            .unwrap()
            .insert(collection_id.to_string(), configuration);
        Arc::new(store)
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self, collection_id: &str) -> bool {
        self.initialized.lock().unwrap().contains(collection_id)
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError> {
        self.initialized
            .lock()
            .unwrap()
            .insert(collection_id.to_string());
        Ok(())
    }

    async fn create_configuration(
        &self,
        configuration: &AnonymizerConfiguration,
        collection_id: &str,
    ) -> Result<(), JobError> {
        self.configurations
            .lock()
            .unwrap()
            .entry(collection_id.to_string())
            .or_insert_with(|| configuration.clone());
        Ok(())
    }

    async fn get_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Option<AnonymizerConfiguration>, JobError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .configurations
            .lock()
            .unwrap()
            .get(collection_id)
            .cloned())
    }
}
