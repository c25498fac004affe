//! Database migrations for the order bridge.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_05_12_000001_create_connections;
mod m2025_05_12_000002_create_sent_orders;
mod m2025_05_12_000003_create_retry_queue;
mod m2025_05_12_000004_create_sync_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_05_12_000001_create_connections::Migration),
            Box::new(m2025_05_12_000002_create_sent_orders::Migration),
            Box::new(m2025_05_12_000003_create_retry_queue::Migration),
            Box::new(m2025_05_12_000004_create_sync_logs::Migration),
        ]
    }
}
