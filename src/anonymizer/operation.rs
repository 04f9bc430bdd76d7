//! Transform operations applied to each exported resource.
//!
//! [`AnonymizeOperation`] resolves the collection's configuration once per
//! instance and caches the compiled engine. [`PassthroughOperation`] copies
//! resources unchanged but still requires the collection to be configured.
//! Both regenerate search indices for the stored copy.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::configuration::AnonymizerConfiguration;
use super::engine::AnonymizerEngine;
use super::indexer::SearchIndexer;
use crate::jobs::{JobError, ResourceWrapper};

/// Storage for per-collection de-identification configurations.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Provisions the destination collection. Idempotent.
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError>;

    /// Stores `configuration` for `collection_id`. A second call for the same
    /// collection leaves the first configuration in place.
    async fn create_configuration(
        &self,
        configuration: &AnonymizerConfiguration,
        collection_id: &str,
    ) -> Result<(), JobError>;

    async fn get_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Option<AnonymizerConfiguration>, JobError>;
}

/// Per-resource transform used by the anonymize job.
#[async_trait]
pub trait AnonymizationOperation: Send + Sync {
    /// Provisions the destination collection.
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError>;

    /// Resolves the compiled configuration for `collection_id`. Missing or
    /// invalid configurations are errors, never a silent passthrough.
    async fn resolve_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Arc<AnonymizerEngine>, JobError>;

    /// De-identifies `resource` and regenerates its search indices.
    fn anonymize(
        &self,
        resource: ResourceWrapper,
        engine: &AnonymizerEngine,
    ) -> Result<ResourceWrapper, JobError>;

    /// Regenerates search indices without touching the body.
    fn copy_without_anonymize(&self, resource: ResourceWrapper) -> ResourceWrapper;
}

/// Builds a fresh operation, and so a fresh cache, for each job run.
pub type OperationFactory = Arc<dyn Fn() -> Arc<dyn AnonymizationOperation> + Send + Sync>;

fn reindex(indexer: &dyn SearchIndexer, mut resource: ResourceWrapper) -> ResourceWrapper {
    resource.search_indices = indexer.extract(&resource.raw_resource);
    resource
}

pub struct AnonymizeOperation {
    store: Arc<dyn ConfigurationStore>,
    indexer: Arc<dyn SearchIndexer>,
    engines: Mutex<LruCache<String, Arc<AnonymizerEngine>>>,
    initialized: Mutex<HashSet<String>>,
}

impl AnonymizeOperation {
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        indexer: Arc<dyn SearchIndexer>,
        cache_capacity: NonZeroUsize,
    ) -> Self {
        Self {
            store,
            indexer,
            engines: Mutex::new(LruCache::new(cache_capacity)),
            initialized: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl AnonymizationOperation for AnonymizeOperation {
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError> {
        let mut initialized = self.initialized.lock().await;
        if initialized.contains(collection_id) {
            return Ok(());
        }
        self.store.initialize_collection(collection_id).await?;
        initialized.insert(collection_id.to_string());
        info!(collection_id, "Initialized destination collection");
        Ok(())
    }

    async fn resolve_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Arc<AnonymizerEngine>, JobError> {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(collection_id) {
            debug!(collection_id, "Using cached anonymization configuration");
            return Ok(Arc::clone(engine));
        }

        let configuration = self
            .store
            .get_configuration(collection_id)
            .await?
            .ok_or_else(|| JobError::ConfigurationNotFound {
                collection_id: collection_id.to_string(),
            })?;

        let engine = Arc::new(
            AnonymizerEngine::new(configuration)
                .map_err(|e| JobError::InvalidConfiguration(e.to_string()))?,
        );
        engines.put(collection_id.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    fn anonymize(
        &self,
        mut resource: ResourceWrapper,
        engine: &AnonymizerEngine,
    ) -> Result<ResourceWrapper, JobError> {
        resource.raw_resource = engine
            .anonymize_resource(&resource.resource_id, &resource.raw_resource)
            .map_err(|e| {
                JobError::Transform(format!(
                    "{}/{}: {e}",
                    resource.resource_type, resource.resource_id
                ))
            })?;
        Ok(reindex(self.indexer.as_ref(), resource))
    }

    fn copy_without_anonymize(&self, resource: ResourceWrapper) -> ResourceWrapper {
        reindex(self.indexer.as_ref(), resource)
    }
}

/// Exports resources unchanged.
pub struct PassthroughOperation {
    store: Arc<dyn ConfigurationStore>,
    indexer: Arc<dyn SearchIndexer>,
    engine: Arc<AnonymizerEngine>,
}

impl PassthroughOperation {
    pub fn new(store: Arc<dyn ConfigurationStore>, indexer: Arc<dyn SearchIndexer>) -> Self {
        Self {
            store,
            indexer,
            engine: Arc::new(AnonymizerEngine::passthrough()),
        }
    }
}

#[async_trait]
impl AnonymizationOperation for PassthroughOperation {
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError> {
        self.store.initialize_collection(collection_id).await
    }

    async fn resolve_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Arc<AnonymizerEngine>, JobError> {
        if self.store.get_configuration(collection_id).await?.is_none() {
            return Err(JobError::ConfigurationNotFound {
                collection_id: collection_id.to_string(),
            });
        }
        Ok(Arc::clone(&self.engine))
    }

    fn anonymize(
        &self,
        resource: ResourceWrapper,
        _engine: &AnonymizerEngine,
    ) -> Result<ResourceWrapper, JobError> {
        Ok(self.copy_without_anonymize(resource))
    }

    fn copy_without_anonymize(&self, resource: ResourceWrapper) -> ResourceWrapper {
        reindex(self.indexer.as_ref(), resource)
    }
}
