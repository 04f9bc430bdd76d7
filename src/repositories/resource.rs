//! Resource repository
//!
//! SeaORM-backed [`ResourceStore`] over the `resources` table. Each
//! (collection, type, id) has one current row; superseded versions are either
//! kept as history rows or deleted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set,
    TransactionTrait,
};

use crate::jobs::{
    JobError, ResourceStore, ResourceWrapper, SaveOutcome, SearchIndexEntry, UpsertOptions,
    UpsertOutcome,
};
use crate::models::resource::{self, Column, Entity as Resource};

#[derive(Debug, Clone)]
pub struct ResourceRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ResourceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

/// Converts a stored row into the wrapper handed to collaborators.
pub(crate) fn to_wrapper(model: resource::Model) -> Result<ResourceWrapper, JobError> {
    let search_indices: Vec<SearchIndexEntry> = serde_json::from_value(model.search_indices)?;

    Ok(ResourceWrapper {
        resource_id: model.resource_id,
        resource_type: model.resource_type,
        version: Some(model.version.to_string()),
        last_modified: model.last_updated.with_timezone(&Utc),
        raw_resource: model.raw_resource,
        search_indices,
    })
}

#[async_trait]
impl ResourceStore for ResourceRepository {
    async fn upsert(
        &self,
        resource: ResourceWrapper,
        options: UpsertOptions,
        collection_id: &str,
    ) -> Result<UpsertOutcome, JobError> {
        let txn = self.db.begin().await.map_err(JobError::from_destination)?;

        let current = Resource::find()
            .filter(Column::CollectionId.eq(collection_id))
            .filter(Column::ResourceType.eq(resource.resource_type.as_str()))
            .filter(Column::ResourceId.eq(resource.resource_id.as_str()))
            .filter(Column::IsHistory.eq(false))
            .one(&txn)
            .await
            .map_err(JobError::from_destination)?;

        if let Some(expected) = options.expected_version.as_deref() {
            let matches = current
                .as_ref()
                .is_some_and(|row| row.version.to_string() == expected);
            if !matches {
                return Err(JobError::ResourceVersionConflict {
                    resource_type: resource.resource_type,
                    resource_id: resource.resource_id,
                });
            }
        }

        let (next_version, outcome) = match current {
            Some(row) => {
                let next_version = row.version + 1;
                if options.keep_history {
                    let mut superseded: resource::ActiveModel = row.into();
                    superseded.is_history = Set(true);
                    superseded
                        .update(&txn)
                        .await
                        .map_err(JobError::from_destination)?;
                } else {
                    row.delete(&txn).await.map_err(JobError::from_destination)?;
                }
                (next_version, SaveOutcome::Updated)
            }
            None if options.allow_create => (1, SaveOutcome::Created),
            None => {
                return Err(JobError::ResourceNotFound {
                    resource_type: resource.resource_type,
                    resource_id: resource.resource_id,
                });
            }
        };

        let row = resource::ActiveModel {
            collection_id: Set(collection_id.to_string()),
            resource_type: Set(resource.resource_type),
            resource_id: Set(resource.resource_id),
            version: Set(next_version),
            is_history: Set(false),
            raw_resource: Set(resource.raw_resource),
            search_indices: Set(serde_json::to_value(&resource.search_indices)?),
            last_updated: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };
        let stored = row.insert(&txn).await.map_err(JobError::from_destination)?;

        txn.commit().await.map_err(JobError::from_destination)?;

        Ok(UpsertOutcome {
            resource: to_wrapper(stored)?,
            outcome,
        })
    }

    async fn get(
        &self,
        resource_type: &str,
        resource_id: &str,
        collection_id: &str,
    ) -> Result<Option<ResourceWrapper>, JobError> {
        Resource::find()
            .filter(Column::CollectionId.eq(collection_id))
            .filter(Column::ResourceType.eq(resource_type))
            .filter(Column::ResourceId.eq(resource_id))
            .filter(Column::IsHistory.eq(false))
            .one(&*self.db)
            .await
            .map_err(JobError::from_destination)?
            .map(to_wrapper)
            .transpose()
    }
}
