//! Anonymize job orchestrator
//!
//! Drives one export job: pages through the source collection, transforms
//! each resource, upserts the copy into the destination collection and
//! checkpoints progress every `pages_per_commit` pages so an interrupted job
//! resumes from its last checkpoint.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::error::{JobError, UNKNOWN_ERROR_MESSAGE, UNKNOWN_ERROR_STATUS};
use super::query::QueryParameters;
use super::record::{FailureDetails, JobProgress, JobRecord, JobStatus, VersionToken};
use super::scope::ScopeFactory;
use super::traits::{JobStore, ResourceStore, ResourceWrapper, SearchService, UpsertOptions};
use crate::anonymizer::{AnonymizationOperation, AnonymizerEngine, OperationFactory};
use crate::config::AnonymizeJobConfig;

/// How a run ended when it did not raise an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Cancelled,
}

/// The record being driven plus the token of its last successful write.
struct JobRun {
    record: JobRecord,
    version: VersionToken,
}

impl JobRun {
    fn progress_mut(&mut self) -> &mut JobProgress {
        self.record.progress.get_or_insert_with(JobProgress::default)
    }
}

/// Executes a single anonymize job.
pub struct AnonymizeJobTask {
    job_store: ScopeFactory<dyn JobStore>,
    search: ScopeFactory<dyn SearchService>,
    resource_store: ScopeFactory<dyn ResourceStore>,
    operation: Arc<dyn AnonymizationOperation>,
    config: AnonymizeJobConfig,
}

impl AnonymizeJobTask {
    pub fn new(
        job_store: ScopeFactory<dyn JobStore>,
        search: ScopeFactory<dyn SearchService>,
        resource_store: ScopeFactory<dyn ResourceStore>,
        operation: Arc<dyn AnonymizationOperation>,
        config: AnonymizeJobConfig,
    ) -> Self {
        Self {
            job_store,
            search,
            resource_store,
            operation,
            config,
        }
    }

    /// Runs the job to completion, failure or cancellation.
    ///
    /// Outcomes are only observable through the job store. A version conflict
    /// means another process owns the job; the run stops without writing.
    #[instrument(skip_all, fields(job_id = %record.id, collection_id = %record.collection_id))]
    pub async fn execute(
        &self,
        record: JobRecord,
        version: VersionToken,
        cancel: CancellationToken,
    ) {
        if record.status.is_terminal() {
            warn!(status = %record.status, "Refusing to run a job in a terminal status");
            return;
        }

        let mut run = JobRun { record, version };
        let started = Instant::now();

        match self.run(&mut run, &cancel).await {
            Ok(RunOutcome::Completed) => {
                counter!("anonymize_jobs_completed_total").increment(1);
                info!(
                    page = run.record.page(),
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Anonymize job completed"
                );
            }
            Ok(RunOutcome::Cancelled) | Err(JobError::Cancelled) => {
                info!(
                    page = run.record.page(),
                    "Anonymize job stopped by cancellation"
                );
            }
            Err(JobError::Conflict { .. }) => {
                counter!("anonymize_job_conflicts_total").increment(1);
                info!("The job was updated by another process");
            }
            Err(JobError::DestinationConnection {
                message,
                status_code,
            }) => {
                error!(%message, status_code, "Can't connect to destination store");
                self.fail(&mut run, FailureDetails::new(message, status_code))
                    .await;
            }
            Err(err) => {
                error!(error = %err, "Anonymize job failed");
                self.fail(
                    &mut run,
                    FailureDetails::new(UNKNOWN_ERROR_MESSAGE, UNKNOWN_ERROR_STATUS),
                )
                .await;
            }
        }
    }

    async fn run(
        &self,
        run: &mut JobRun,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, JobError> {
        let collection_id = run.record.collection_id.clone();

        run.record.start_time = Some(Utc::now());
        if run.record.status == JobStatus::Queued {
            run.record.status = JobStatus::Running;
        }

        self.operation.initialize_collection(&collection_id).await?;
        let engine = self.operation.resolve_configuration(&collection_id).await?;

        let mut query = QueryParameters::for_export(
            self.config.max_resources_per_query,
            run.record.queued_time,
        );
        let resume_token = run.progress_mut().continuation_token().map(str::to_owned);
        if let Some(token) = resume_token {
            debug!(page = run.record.page(), "Resuming from checkpoint");
            query.set_continuation_token(&token);
        }

        while run.progress_mut().has_more() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let page_started = Instant::now();
            let result = {
                let search = self.search.acquire().await?;
                search
                    .search(run.record.resource_type.as_deref(), query.as_slice(), cancel)
                    .await?
            };

            let written = self
                .process_page(result.results, &collection_id, &engine)
                .await?;
            counter!("anonymize_pages_total").increment(1);
            counter!("anonymize_resources_total").increment(written as u64);
            histogram!("anonymize_page_duration_ms")
                .record(page_started.elapsed().as_secs_f64() * 1000.0);

            match result.continuation_token {
                None => run.progress_mut().exhaust(),
                Some(token) => {
                    query.set_continuation_token(&token);
                    let progress = run.progress_mut();
                    progress.advance(token);
                    let page = progress.page();
                    debug!(page, written, "Processed page");

                    if page % self.config.pages_per_commit == 0 {
                        self.update_job_record(run).await?;
                        counter!("anonymize_checkpoints_total").increment(1);
                        info!(page, "Checkpointed progress");
                    }
                }
            }
        }

        run.record.finish(JobStatus::Completed, None, Utc::now());
        self.update_job_record(run).await?;
        Ok(RunOutcome::Completed)
    }

    /// Transforms and stores one page, one resource at a time.
    async fn process_page(
        &self,
        resources: Vec<ResourceWrapper>,
        collection_id: &str,
        engine: &AnonymizerEngine,
    ) -> Result<usize, JobError> {
        let mut written = 0;
        for resource in resources {
            let transformed = self.operation.anonymize(resource, engine)?;
            let store = self.resource_store.acquire().await?;
            store
                .upsert(transformed, UpsertOptions::export(), collection_id)
                .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn update_job_record(&self, run: &mut JobRun) -> Result<(), JobError> {
        let store = self.job_store.acquire().await?;
        let outcome = store.update_job(&run.record, &run.version).await?;
        run.record = outcome.record;
        run.version = outcome.version;
        Ok(())
    }

    async fn fail(&self, run: &mut JobRun, details: FailureDetails) {
        counter!("anonymize_jobs_failed_total").increment(1);
        run.record.finish(JobStatus::Failed, Some(details), Utc::now());

        if let Err(err) = self.update_job_record(run).await {
            error!(error = %err, "Failed to record job failure");
        }
    }
}

/// Builds one [`AnonymizeJobTask`] per job run, sharing collaborators and
/// lease limits across runs but giving each run its own transform operation.
#[derive(Clone)]
pub struct AnonymizeJobTaskFactory {
    job_store: ScopeFactory<dyn JobStore>,
    search: ScopeFactory<dyn SearchService>,
    resource_store: ScopeFactory<dyn ResourceStore>,
    operation_factory: OperationFactory,
    config: AnonymizeJobConfig,
}

impl AnonymizeJobTaskFactory {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        search: Arc<dyn SearchService>,
        resource_store: Arc<dyn ResourceStore>,
        operation_factory: OperationFactory,
        config: AnonymizeJobConfig,
    ) -> Self {
        Self {
            job_store: ScopeFactory::new(job_store),
            search: ScopeFactory::bounded(search, config.search_concurrency),
            resource_store: ScopeFactory::bounded(resource_store, config.store_concurrency),
            operation_factory,
            config,
        }
    }

    pub fn create(&self) -> AnonymizeJobTask {
        AnonymizeJobTask::new(
            self.job_store.clone(),
            self.search.clone(),
            self.resource_store.clone(),
            (self.operation_factory)(),
            self.config.clone(),
        )
    }
}
