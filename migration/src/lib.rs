//! Database migrations for the subsync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000001_create_connections;
mod m2025_12_01_000002_create_processed_emails;
mod m2025_12_01_000003_create_subscriptions;
mod m2025_12_01_000004_create_sync_jobs;
mod m2025_12_01_000005_add_sync_job_single_flight_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000001_create_connections::Migration),
            Box::new(m2025_12_01_000002_create_processed_emails::Migration),
            Box::new(m2025_12_01_000003_create_subscriptions::Migration),
            Box::new(m2025_12_01_000004_create_sync_jobs::Migration),
            Box::new(m2025_12_01_000005_add_sync_job_single_flight_guard::Migration),
        ]
    }
}
