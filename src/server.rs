//! # Server Configuration
//!
//! Router construction and process wiring: repositories, the job worker and
//! the HTTP listener share one database pool and one shutdown token.

use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::anonymizer::{
    AnonymizationOperation, AnonymizeOperation, ConfigurationStore, FlatteningSearchIndexer,
    OperationFactory, PassthroughOperation, SearchIndexer,
};
use crate::config::{AppConfig, TransformMode};
use crate::handlers;
use crate::jobs::{AnonymizeJobTaskFactory, JobStore, JobWorker};
use crate::repositories::{
    ConfigurationRepository, JobRepository, ResourceRepository, ResourceSearchService,
};
use crate::telemetry::{self, REQUEST_ID_HEADER, TraceContext};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub configuration_store: Arc<dyn ConfigurationStore>,
    pub job_store: Arc<dyn JobStore>,
}

impl AppState {
    /// State backed by the SeaORM repositories.
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection) -> Self {
        let shared = Arc::new(db.clone());
        Self {
            config,
            db,
            configuration_store: Arc::new(ConfigurationRepository::new(Arc::clone(&shared))),
            job_store: Arc::new(JobRepository::new(shared)),
        }
    }
}

async fn trace_context(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    let context = TraceContext::from_request_id(request_id);

    telemetry::with_trace_context(context, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/anonymize/{collection_id}", post(handlers::create_anonymize_job))
        .route(
            "/anonymize/jobs/{job_id}",
            get(handlers::get_anonymize_job).delete(handlers::cancel_anonymize_job),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(trace_context)),
        )
}

/// Selects the per-resource transform from configuration.
pub fn operation_factory(
    config: &AppConfig,
    configuration_store: Arc<dyn ConfigurationStore>,
) -> OperationFactory {
    let indexer: Arc<dyn SearchIndexer> = Arc::new(FlatteningSearchIndexer);

    match config.job.transform_mode {
        TransformMode::Anonymize => {
            let cache_size = NonZeroUsize::new(config.job.configuration_cache_size)
                .unwrap_or(NonZeroUsize::MIN);
            Arc::new(move || -> Arc<dyn AnonymizationOperation> {
                Arc::new(AnonymizeOperation::new(
                    Arc::clone(&configuration_store),
                    Arc::clone(&indexer),
                    cache_size,
                ))
            })
        }
        TransformMode::Passthrough => Arc::new(move || -> Arc<dyn AnonymizationOperation> {
            Arc::new(PassthroughOperation::new(
                Arc::clone(&configuration_store),
                Arc::clone(&indexer),
            ))
        }),
    }
}

/// Builds the job worker over the SeaORM repositories.
pub fn build_worker(config: &AppConfig, db: Arc<DatabaseConnection>) -> JobWorker {
    let job_store: Arc<dyn JobStore> = Arc::new(JobRepository::new(Arc::clone(&db)));
    let configuration_store: Arc<dyn ConfigurationStore> =
        Arc::new(ConfigurationRepository::new(Arc::clone(&db)));
    let search = Arc::new(
        ResourceSearchService::new(Arc::clone(&db), config.source_collection_id.clone())
            .with_max_page_size(config.job.max_resources_per_query),
    );
    let resource_store = Arc::new(ResourceRepository::new(db));

    let tasks = AnonymizeJobTaskFactory::new(
        Arc::clone(&job_store),
        search,
        resource_store,
        operation_factory(config, configuration_store),
        config.job.clone(),
    );

    JobWorker::new(job_store, tasks, config.job.clone())
}

/// Starts the worker and the HTTP server; both stop on Ctrl-C.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let shutdown = CancellationToken::new();
    let worker = build_worker(&config, Arc::new(db.clone()));
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let state = AppState::new(Arc::new(config.clone()), db);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        profile = %config.profile,
        source_collection_id = %config.source_collection_id,
        "Anonymizer listening"
    );

    let signal_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            signal_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        tracing::error!("Job worker task failed: {}", e);
    }

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::anonymize::create_anonymize_job,
        crate::handlers::anonymize::get_anonymize_job,
        crate::handlers::anonymize::cancel_anonymize_job,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::anonymizer::AnonymizerConfiguration,
            crate::anonymizer::PathRule,
            crate::anonymizer::AnonymizationMethod,
            crate::anonymizer::AnonymizerParameters,
            crate::jobs::JobStatus,
            crate::jobs::FailureDetails,
            crate::handlers::anonymize::CreateJobResponse,
            crate::handlers::anonymize::JobStatusResponse,
        )
    ),
    tags(
        (name = "root", description = "Service information"),
        (name = "anonymize", description = "De-identified export jobs"),
    ),
    info(
        title = "Anonymizer API",
        description = "Resumable de-identified export of stored clinical resources",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
