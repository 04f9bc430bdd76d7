//! Database migrations for the anonymizer service.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_000001_create_anonymize_jobs;
mod m2025_06_01_000002_create_anonymization_configurations;
mod m2025_06_01_000003_create_resource_collections;
mod m2025_06_01_000004_create_resources;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_000001_create_anonymize_jobs::Migration),
            Box::new(m2025_06_01_000002_create_anonymization_configurations::Migration),
            Box::new(m2025_06_01_000003_create_resource_collections::Migration),
            Box::new(m2025_06_01_000004_create_resources::Migration),
        ]
    }
}
