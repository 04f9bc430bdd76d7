//! Job Worker
//!
//! Background loop that acquires runnable anonymize jobs from the job store
//! and executes them with bounded concurrency. Jobs whose heartbeat went stale
//! (a crashed worker) are re-acquired and resume from their last checkpoint.

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, thread_rng};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::error::JobError;
use super::orchestrator::AnonymizeJobTaskFactory;
use super::traits::JobStore;
use crate::config::AnonymizeJobConfig;

pub struct JobWorker {
    job_store: Arc<dyn JobStore>,
    tasks: AnonymizeJobTaskFactory,
    config: AnonymizeJobConfig,
    /// One permit per job slot, held by each running job.
    slots: Arc<Semaphore>,
}

impl JobWorker {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        tasks: AnonymizeJobTaskFactory,
        config: AnonymizeJobConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            job_store,
            tasks,
            config,
            slots,
        }
    }

    /// Polls until `shutdown` fires, topping up free job slots on every poll.
    /// Running jobs observe the same token and stop at their next page
    /// boundary; the loop waits for them before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            polling_secs = self.config.polling_frequency_seconds,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting anonymize job worker"
        );

        let mut running = JoinSet::new();
        loop {
            reap_finished(&mut running);

            match self.dispatch(&mut running, &shutdown).await {
                Ok(count) if count > 0 => debug!("Started {} anonymize jobs", count),
                Ok(_) => {}
                Err(e) => error!("Error acquiring anonymize jobs: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }

        drain(&mut running).await;
        info!("Anonymize job worker stopped");
    }

    /// Acquires runnable jobs for the free slots and executes them, returning
    /// once they all finish.
    pub async fn acquire_and_run_jobs(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<usize, JobError> {
        let mut running = JoinSet::new();
        let count = self.dispatch(&mut running, shutdown).await;
        drain(&mut running).await;
        count
    }

    #[instrument(skip_all, fields(max_jobs = self.config.max_concurrent_jobs))]
    async fn dispatch(
        &self,
        running: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<usize, JobError> {
        if shutdown.is_cancelled() {
            return Ok(0);
        }

        let free = self.slots.available_permits();
        if free == 0 {
            debug!("All anonymize job slots busy");
            return Ok(0);
        }

        let jobs = self
            .job_store
            .acquire_jobs(
                free,
                Duration::from_secs(self.config.heartbeat_timeout_seconds),
            )
            .await?;
        let count = jobs.len();

        if jobs.is_empty() {
            debug!("No runnable anonymize jobs");
            return Ok(0);
        }

        info!(free, "Acquired {} anonymize jobs", count);

        for job in jobs {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| JobError::Cancelled)?;
            let task = self.tasks.create();
            let cancel = shutdown.child_token();

            running.spawn(async move {
                let _permit = permit;
                task.execute(job.record, job.version, cancel).await;
            });
        }

        Ok(count)
    }

    fn poll_interval(&self) -> Duration {
        let base = self.config.polling_frequency_seconds as f64;
        let spread = base * self.config.polling_jitter_factor;
        let jitter = if spread > 0.0 {
            thread_rng().gen_range(-spread..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(1.0))
    }
}

fn reap_finished(running: &mut JoinSet<()>) {
    while let Some(joined) = running.try_join_next() {
        if let Err(e) = joined {
            error!("Anonymize job task panicked: {}", e);
        }
    }
}

async fn drain(running: &mut JoinSet<()>) {
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("Anonymize job task panicked: {}", e);
        }
    }
}
