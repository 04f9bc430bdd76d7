//! Resource search
//!
//! SeaORM-backed [`SearchService`] over the source partition of the
//! `resources` table. Pages are keyset-paginated on the surrogate id and the
//! continuation token names the last id of the previous page, so rows written
//! while a scan is in flight never shift it.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use tokio_util::sync::CancellationToken;

use super::resource::to_wrapper;
use crate::cursor::{ContinuationData, decode_continuation_token, encode_continuation_token};
use crate::jobs::{JobError, SearchParameters, SearchResult, SearchService};
use crate::models::resource::{Column, Entity as Resource};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct ResourceSearchService {
    pub db: Arc<DatabaseConnection>,
    source_collection_id: String,
    max_page_size: u32,
}

impl ResourceSearchService {
    pub fn new<S: Into<String>>(db: Arc<DatabaseConnection>, source_collection_id: S) -> Self {
        Self {
            db,
            source_collection_id: source_collection_id.into(),
            max_page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }
}

#[async_trait]
impl SearchService for ResourceSearchService {
    async fn search(
        &self,
        resource_type: Option<&str>,
        query_parameters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SearchResult, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let params = SearchParameters::parse(query_parameters)?;
        let page_size = params
            .count
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(self.max_page_size);

        let mut query = Resource::find()
            .filter(Column::CollectionId.eq(self.source_collection_id.as_str()))
            .filter(Column::IsHistory.eq(false));

        if let Some(resource_type) = resource_type {
            query = query.filter(Column::ResourceType.eq(resource_type));
        }
        if let Some(bound) = params.last_updated_le {
            query = query.filter(Column::LastUpdated.lte(bound.fixed_offset()));
        }
        if let Some(token) = params.continuation_token.as_deref() {
            let position = decode_continuation_token(token)?;
            query = query.filter(Column::Id.gt(position.after));
        }

        let mut rows = query
            .order_by_asc(Column::Id)
            .limit(u64::from(page_size) + 1)
            .all(&*self.db)
            .await?;

        let has_more = rows.len() > page_size as usize;
        rows.truncate(page_size as usize);

        let continuation_token = match rows.last() {
            Some(last) if has_more => Some(encode_continuation_token(&ContinuationData {
                after: last.id,
            })?),
            _ => None,
        };

        tracing::debug!(
            resource_type = resource_type.unwrap_or("*"),
            returned = rows.len(),
            has_more,
            "Resource search page"
        );

        Ok(SearchResult {
            results: rows.into_iter().map(to_wrapper).collect::<Result<_, _>>()?,
            continuation_token,
        })
    }
}
