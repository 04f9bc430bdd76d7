//! Migration to create the anonymization_configurations table.
//!
//! One immutable de-identification configuration per destination collection.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AnonymizationConfigurations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnonymizationConfigurations::CollectionId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AnonymizationConfigurations::Configuration)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnonymizationConfigurations::CreatedAt)
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
            .drop_table(
                Table::drop()
                    .table(AnonymizationConfigurations::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum AnonymizationConfigurations {
    Table,
    CollectionId,
    Configuration,
    CreatedAt,
}
