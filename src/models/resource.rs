//! Resource entity model
//!
//! Stored clinical records. Source data and de-identified copies share the
//! table and are told apart by `collection_id`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// One stored version of a resource
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "resources")]
pub struct Model {
    /// Surrogate key; monotonically increasing, used as the scan order
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Collection (tenant partition) the row belongs to
    pub collection_id: String,

    /// Resource type, e.g. `Patient`
    pub resource_type: String,

    /// Logical resource id, unique per collection and type
    pub resource_id: String,

    /// Version number, starting at 1
    pub version: i32,

    /// True for superseded versions kept as history
    pub is_history: bool,

    /// Raw resource JSON
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_resource: JsonValue,

    /// Extracted search index entries
    #[sea_orm(column_type = "JsonBinary")]
    pub search_indices: JsonValue,

    pub last_updated: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
