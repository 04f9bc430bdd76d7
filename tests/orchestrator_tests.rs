//! Integration tests for the anonymize job orchestrator and worker, driven
//! entirely through in-memory collaborators.

use std::sync::Arc;

use anonymizer::config::{AnonymizeJobConfig, AppConfig};
use anonymizer::jobs::{
    AnonymizeJobTaskFactory, FailureDetails, JobProgress, JobRecord, JobStatus, JobWorker,
};
use anonymizer::server::operation_factory;
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{
    GatedSearch, InMemoryConfigurationStore, InMemoryJobStore, RecordingResourceStore,
    ScriptedSearch, StoreFailure, job_config, redact_names,
};

const COLLECTION: &str = "deid";

struct Harness {
    jobs: Arc<InMemoryJobStore>,
    search: Arc<ScriptedSearch>,
    store: Arc<RecordingResourceStore>,
    configs: Arc<InMemoryConfigurationStore>,
    tasks: AnonymizeJobTaskFactory,
}

fn harness(
    search: ScriptedSearch,
    store: RecordingResourceStore,
    configs: Arc<InMemoryConfigurationStore>,
    config: AnonymizeJobConfig,
) -> Harness {
    let jobs = InMemoryJobStore::new();
    let search = Arc::new(search);
    let store = Arc::new(store);
    let app_config = AppConfig {
        job: config.clone(),
        ..AppConfig::default()
    };

    let tasks = AnonymizeJobTaskFactory::new(
        jobs.clone(),
        search.clone(),
        store.clone(),
        operation_factory(&app_config, configs.clone()),
        config,
    );

    Harness {
        jobs,
        search,
        store,
        configs,
        tasks,
    }
}

fn configured() -> Arc<InMemoryConfigurationStore> {
    InMemoryConfigurationStore::with(COLLECTION, redact_names())
}

impl Harness {
    async fn run(&self, record: JobRecord) -> JobRecord {
        let id = record.id;
        let version = self.jobs.seed(record.clone());
        self.tasks
            .create()
            .execute(record, version, CancellationToken::new())
            .await;
        self.jobs.stored(id)
    }
}

#[tokio::test]
async fn single_page_completes_with_one_write() {
    let h = harness(
        ScriptedSearch::with_pages(1, 3),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );

    let stored = h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.page(), 0);
    assert_eq!(stored.progress, Some(JobProgress::Exhausted { page: 0 }));
    assert!(stored.start_time.is_some());
    assert!(stored.end_time.is_some());
    assert_eq!(stored.failure_details, None);
    assert_eq!(h.store.upserts().len(), 3);
    assert_eq!(h.jobs.write_count(), 1);
}

#[tokio::test]
async fn destination_failure_after_checkpoints_records_carried_details() {
    let h = harness(
        ScriptedSearch::with_pages(30, 2),
        RecordingResourceStore::failing_on(
            "p25-0",
            StoreFailure::Destination {
                message: "connection refused".to_string(),
                status_code: 503,
            },
        ),
        configured(),
        job_config(10),
    );

    let stored = h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    let writes = h.jobs.writes();
    assert_eq!(writes.len(), 3, "two checkpoints and the failure");
    assert_eq!(writes[0].page(), 10);
    assert_eq!(writes[0].status, JobStatus::Running);
    assert_eq!(writes[1].page(), 20);

    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.failure_details,
        Some(FailureDetails::new("connection refused", 503))
    );
    assert!(stored.end_time.is_some());
    assert_eq!(stored.page(), 25);
    assert_eq!(h.search.calls().len(), 26);
}

#[tokio::test]
async fn external_update_stops_the_run_without_writing() {
    let jobs_hook: Arc<std::sync::OnceLock<(Arc<InMemoryJobStore>, uuid::Uuid)>> =
        Arc::new(std::sync::OnceLock::new());
    let hook_target = Arc::clone(&jobs_hook);
    let search = ScriptedSearch::with_pages(12, 1).on_page(Arc::new(move |index| {
        if index == 7
            && let Some((jobs, job_id)) = hook_target.get()
        {
            jobs.touch(*job_id);
        }
    }));
    let h = harness(search, RecordingResourceStore::new(), configured(), job_config(5));

    let record = JobRecord::new(COLLECTION, None, Utc::now());
    let _ = jobs_hook.set((Arc::clone(&h.jobs), record.id));
    let stored = h.run(record).await;

    assert_eq!(h.jobs.write_count(), 1, "only the first checkpoint lands");
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.page(), 5);
    assert_eq!(stored.end_time, None);
    assert_eq!(h.search.calls().len(), 10);
    assert!(!h.store.upserted_ids().contains("p10-0"));
}

#[tokio::test]
async fn missing_configuration_fails_with_unknown_error() {
    let h = harness(
        ScriptedSearch::with_pages(3, 1),
        RecordingResourceStore::new(),
        InMemoryConfigurationStore::empty(),
        job_config(10),
    );

    let stored = h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.failure_details,
        Some(FailureDetails::new("Unknown error", 500))
    );
    assert!(stored.end_time.is_some());
    let start = stored.start_time.expect("attempt stamps a start time");
    assert!(stored.end_time.is_some_and(|end| end >= start));
    assert!(h.search.calls().is_empty());
    assert!(h.store.upserts().is_empty());
    assert_eq!(h.jobs.write_count(), 1);
}

#[tokio::test]
async fn unexpected_store_error_is_classified_as_unknown() {
    let h = harness(
        ScriptedSearch::with_pages(2, 2),
        RecordingResourceStore::failing_on("p1-1", StoreFailure::Unexpected),
        configured(),
        job_config(10),
    );

    let stored = h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.failure_details,
        Some(FailureDetails::new("Unknown error", 500))
    );
}

#[tokio::test]
async fn resumes_from_stored_continuation_token() {
    let h = harness(
        ScriptedSearch::with_pages(5, 2),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );
    let mut record = JobRecord::new(COLLECTION, None, Utc::now());
    record.status = JobStatus::Running;
    record.progress = Some(JobProgress::InProgress {
        continuation_token: "token-3".to_string(),
        page: 3,
    });

    let stored = h.run(record).await;

    let calls = h.search.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains(&("ct".to_string(), "token-3".to_string())));

    let ids = h.store.upserted_ids();
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|id| id.starts_with("p3-") || id.starts_with("p4-")));

    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.page(), 4);
}

#[tokio::test]
async fn every_page_carries_count_snapshot_and_single_token() {
    let h = harness(
        ScriptedSearch::with_pages(3, 1),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );
    let queued_time = Utc::now();
    let snapshot = format!(
        "le{}",
        queued_time.to_rfc3339_opts(SecondsFormat::Micros, true)
    );

    h.run(JobRecord::new(
        COLLECTION,
        Some("Patient".to_string()),
        queued_time,
    ))
    .await;

    let calls = h.search.calls();
    assert_eq!(calls.len(), 3);
    for (index, call) in calls.iter().enumerate() {
        assert!(call.contains(&("_count".to_string(), "3".to_string())));
        assert!(call.contains(&("_lastUpdated".to_string(), snapshot.clone())));

        let tokens: Vec<_> = call.iter().filter(|(name, _)| name == "ct").collect();
        match index {
            0 => assert!(tokens.is_empty()),
            n => assert_eq!(tokens, vec![&("ct".to_string(), format!("token-{}", n))]),
        }
    }
    assert!(
        h.search
            .resource_types()
            .iter()
            .all(|t| t.as_deref() == Some("Patient"))
    );
}

#[tokio::test]
async fn stored_copies_are_transformed_and_reindexed() {
    let h = harness(
        ScriptedSearch::with_pages(1, 2),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );

    h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    for (collection, resource) in h.store.upserts() {
        assert_eq!(collection, COLLECTION);
        assert!(resource.raw_resource.get("name").is_none());
        assert_eq!(resource.raw_resource["gender"], "unknown");
        assert_eq!(resource.raw_resource["birthDate"], "1980-04-12");
        assert!(
            resource
                .search_indices
                .iter()
                .any(|entry| entry.path == "gender" && entry.value == "unknown")
        );
        assert!(!resource.search_indices.iter().any(|e| e.path.starts_with("name")));
    }
    assert!(h.configs.is_initialized(COLLECTION));
}

#[tokio::test]
async fn configuration_is_resolved_once_per_run() {
    let h = harness(
        ScriptedSearch::with_pages(6, 3),
        RecordingResourceStore::new(),
        configured(),
        job_config(2),
    );

    h.run(JobRecord::new(COLLECTION, None, Utc::now())).await;

    assert_eq!(h.configs.lookups(), 1);
    assert_eq!(h.store.upserts().len(), 18);
}

#[tokio::test]
async fn cancellation_stops_between_pages_without_writing() {
    let cancel = CancellationToken::new();
    let hook_cancel = cancel.clone();
    let search = ScriptedSearch::with_pages(8, 1).on_page(Arc::new(move |index| {
        if index == 2 {
            hook_cancel.cancel();
        }
    }));
    let h = harness(search, RecordingResourceStore::new(), configured(), job_config(10));

    let record = JobRecord::new(COLLECTION, None, Utc::now());
    let version = h.jobs.seed(record.clone());
    h.tasks.create().execute(record.clone(), version, cancel).await;

    let stored = h.jobs.stored(record.id);
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(h.jobs.write_count(), 0);
    assert_eq!(h.search.calls().len(), 3);
}

#[tokio::test]
async fn terminal_jobs_are_not_run() {
    let h = harness(
        ScriptedSearch::with_pages(2, 1),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );
    let mut record = JobRecord::new(COLLECTION, None, Utc::now());
    record.finish(JobStatus::Canceled, None, Utc::now());

    let stored = h.run(record).await;

    assert_eq!(stored.status, JobStatus::Canceled);
    assert_eq!(h.jobs.write_count(), 0);
    assert!(h.search.calls().is_empty());
}

#[tokio::test]
async fn worker_acquires_and_completes_queued_jobs() {
    let config = AnonymizeJobConfig {
        max_concurrent_jobs: 2,
        ..job_config(10)
    };
    let h = harness(
        ScriptedSearch::with_pages(2, 2),
        RecordingResourceStore::new(),
        configured(),
        config.clone(),
    );
    let first = JobRecord::new(COLLECTION, None, Utc::now());
    let second = JobRecord::new(COLLECTION, None, Utc::now());
    h.jobs.seed(first.clone());
    h.jobs.seed(second.clone());

    let worker = JobWorker::new(h.jobs.clone(), h.tasks.clone(), config);
    let executed = worker
        .acquire_and_run_jobs(&CancellationToken::new())
        .await
        .expect("worker pass");

    assert_eq!(executed, 2);
    assert_eq!(h.jobs.stored(first.id).status, JobStatus::Completed);
    assert_eq!(h.jobs.stored(second.id).status, JobStatus::Completed);

    let idle = worker
        .acquire_and_run_jobs(&CancellationToken::new())
        .await
        .expect("idle pass");
    assert_eq!(idle, 0);
}

#[tokio::test]
async fn worker_loop_exits_on_shutdown() {
    let h = harness(
        ScriptedSearch::with_pages(1, 1),
        RecordingResourceStore::new(),
        configured(),
        job_config(10),
    );
    let record = JobRecord::new(COLLECTION, None, Utc::now());
    h.jobs.seed(record.clone());

    let worker = JobWorker::new(h.jobs.clone(), h.tasks.clone(), job_config(10));
    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(loop_shutdown).await });

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while h.jobs.stored(record.id).status != JobStatus::Completed {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job completes");

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .expect("worker task");
}

#[tokio::test]
async fn worker_fills_free_slot_while_another_job_runs() {
    let config = AnonymizeJobConfig {
        max_concurrent_jobs: 2,
        ..job_config(10)
    };
    let jobs = InMemoryJobStore::new();
    let search = Arc::new(GatedSearch::new(ScriptedSearch::with_pages(1, 1), "Observation"));
    let app_config = AppConfig {
        job: config.clone(),
        ..AppConfig::default()
    };
    let tasks = AnonymizeJobTaskFactory::new(
        jobs.clone(),
        search.clone(),
        Arc::new(RecordingResourceStore::new()),
        operation_factory(&app_config, configured()),
        config.clone(),
    );

    let long = JobRecord::new(COLLECTION, Some("Observation".to_string()), Utc::now());
    jobs.seed(long.clone());

    let worker = JobWorker::new(jobs.clone(), tasks, config);
    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(loop_shutdown).await });

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while search.held() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("long job reaches the search");

    let short = JobRecord::new(COLLECTION, Some("Patient".to_string()), Utc::now());
    jobs.seed(short.clone());

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while jobs.stored(short.id).status != JobStatus::Completed {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second job runs in the free slot");
    assert_eq!(jobs.stored(long.id).status, JobStatus::Running);

    search.open();
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while jobs.stored(long.id).status != JobStatus::Completed {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("long job completes once released");

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .expect("worker task");
}
