//! Migration to create the anonymize_jobs table.
//!
//! Each row is one de-identification export job. `version` is the optimistic
//! concurrency token rotated on every write; `progress` holds the resumable
//! checkpoint.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AnonymizeJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnonymizeJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AnonymizeJobs::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(AnonymizeJobs::CollectionId).text().not_null())
                    .col(ColumnDef::new(AnonymizeJobs::ResourceType).text().null())
                    .col(
                        ColumnDef::new(AnonymizeJobs::QueuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnonymizeJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AnonymizeJobs::EndedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(AnonymizeJobs::Progress).json_binary().null())
                    .col(
                        ColumnDef::new(AnonymizeJobs::FailureDetails)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(AnonymizeJobs::Version).text().not_null())
                    .col(
                        ColumnDef::new(AnonymizeJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AnonymizeJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Worker acquisition scans by status, oldest first.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_anonymize_jobs_status_queued_at")
                    .table(AnonymizeJobs::Table)
                    .col(AnonymizeJobs::Status)
                    .col(AnonymizeJobs::QueuedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AnonymizeJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AnonymizeJobs {
    Table,
    Id,
    Status,
    CollectionId,
    ResourceType,
    QueuedAt,
    StartedAt,
    EndedAt,
    Progress,
    FailureDetails,
    Version,
    CreatedAt,
    UpdatedAt,
}
