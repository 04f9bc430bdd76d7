//! AnonymizeJob entity model
//!
//! SeaORM entity for the anonymize_jobs table. One row per export job; the
//! `version` column is the optimistic concurrency token and changes on every
//! successful write.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Persisted anonymize job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "anonymize_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Lifecycle status (queued, running, completed, failed, canceled)
    pub status: String,

    /// Destination collection the de-identified copies are written into
    pub collection_id: String,

    /// Resource type filter; `None` exports every type
    pub resource_type: Option<String>,

    /// Enqueue time, also the snapshot bound for the source scan
    pub queued_at: DateTimeWithTimeZone,

    /// Start of the most recent execution attempt
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Time the job reached a terminal status
    pub ended_at: Option<DateTimeWithTimeZone>,

    /// Serialized resumable progress
    #[sea_orm(column_type = "JsonBinary")]
    pub progress: Option<JsonValue>,

    /// Serialized failure details for failed jobs
    #[sea_orm(column_type = "JsonBinary")]
    pub failure_details: Option<JsonValue>,

    /// Opaque optimistic concurrency token
    pub version: String,

    pub created_at: DateTimeWithTimeZone,

    /// Last write time; doubles as the worker heartbeat
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
