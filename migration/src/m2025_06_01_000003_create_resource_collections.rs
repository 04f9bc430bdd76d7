//! Migration to create the resource_collections table.
//!
//! A row marks a destination collection as provisioned.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ResourceCollections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ResourceCollections::CollectionId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ResourceCollections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ResourceCollections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ResourceCollections {
    Table,
    CollectionId,
    CreatedAt,
}
