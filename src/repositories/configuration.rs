//! Configuration repository
//!
//! SeaORM-backed [`ConfigurationStore`]. Configurations are immutable once
//! stored: creating one for a collection that already has one is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set};

use crate::anonymizer::{AnonymizerConfiguration, ConfigurationStore};
use crate::jobs::JobError;
use crate::models::{anonymization_configuration, resource_collection};

#[derive(Debug, Clone)]
pub struct ConfigurationRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ConfigurationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConfigurationStore for ConfigurationRepository {
    async fn initialize_collection(&self, collection_id: &str) -> Result<(), JobError> {
        let collection = resource_collection::ActiveModel {
            collection_id: Set(collection_id.to_string()),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let inserted = resource_collection::Entity::insert(collection)
            .on_conflict(
                OnConflict::column(resource_collection::Column::CollectionId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await
            .map_err(JobError::from_destination)?;

        if inserted > 0 {
            tracing::info!(%collection_id, "Provisioned destination collection");
        }
        Ok(())
    }

    async fn create_configuration(
        &self,
        configuration: &AnonymizerConfiguration,
        collection_id: &str,
    ) -> Result<(), JobError> {
        let row = anonymization_configuration::ActiveModel {
            collection_id: Set(collection_id.to_string()),
            configuration: Set(serde_json::to_value(configuration)?),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let inserted = anonymization_configuration::Entity::insert(row)
            .on_conflict(
                OnConflict::column(anonymization_configuration::Column::CollectionId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        if inserted == 0 {
            tracing::debug!(%collection_id, "Configuration already stored, keeping existing");
        }
        Ok(())
    }

    async fn get_configuration(
        &self,
        collection_id: &str,
    ) -> Result<Option<AnonymizerConfiguration>, JobError> {
        let Some(row) = anonymization_configuration::Entity::find_by_id(collection_id.to_string())
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_value(row.configuration)
            .map(Some)
            .map_err(|e| {
                JobError::InvalidConfiguration(format!(
                    "stored configuration for '{}' is unreadable: {}",
                    collection_id, e
                ))
            })
    }
}
