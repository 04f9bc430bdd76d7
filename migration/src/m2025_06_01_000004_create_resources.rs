//! Migration to create the resources table.
//!
//! Resources are stored per collection. The surrogate `id` gives a stable scan
//! order for paged search; superseded versions stay behind with
//! `is_history = true`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Resources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Resources::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Resources::CollectionId).text().not_null())
                    .col(ColumnDef::new(Resources::ResourceType).text().not_null())
                    .col(ColumnDef::new(Resources::ResourceId).text().not_null())
                    .col(
                        ColumnDef::new(Resources::Version)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Resources::IsHistory)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Resources::RawResource).json_binary().not_null())
                    .col(
                        ColumnDef::new(Resources::SearchIndices)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Resources::LastUpdated)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_resources_identity")
                    .table(Resources::Table)
                    .col(Resources::CollectionId)
                    .col(Resources::ResourceType)
                    .col(Resources::ResourceId)
                    .col(Resources::IsHistory)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_resources_collection_last_updated")
                    .table(Resources::Table)
                    .col(Resources::CollectionId)
                    .col(Resources::LastUpdated)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Resources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Resources {
    Table,
    Id,
    CollectionId,
    ResourceType,
    ResourceId,
    Version,
    IsHistory,
    RawResource,
    SearchIndices,
    LastUpdated,
}
