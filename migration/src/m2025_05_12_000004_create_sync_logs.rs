//! Migration to create the sync_logs table.
//!
//! Append-only observability record, one row per executed (or skipped)
//! poll cycle.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncLogs::ConnectionId).uuid().not_null())
                    .col(
                        ColumnDef::new(SyncLogs::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::OrdersFound)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::OrdersSent)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::OrdersFailed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::OrdersSkipped)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncLogs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncLogs::BreakerStateEntry)
                            .text()
                            .not_null()
                            .default("closed"),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::BreakerStateExit)
                            .text()
                            .not_null()
                            .default("closed"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_logs_connection_id")
                            .from(SyncLogs::Table, SyncLogs::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_logs_connection")
                    .table(SyncLogs::Table)
                    .col(SyncLogs::ConnectionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_logs_connection").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLogs {
    Table,
    Id,
    ConnectionId,
    StartedAt,
    OrdersFound,
    OrdersSent,
    OrdersFailed,
    OrdersSkipped,
    DurationMs,
    ErrorMessage,
    BreakerStateEntry,
    BreakerStateExit,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
