//! Migration to create the retry_queue table.
//!
//! Failed webhook deliveries land here with their serialized envelope and a
//! backoff schedule. A partial unique index keeps at most one pending item
//! per `(connection_id, order_id)`.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RetryQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RetryQueue::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RetryQueue::ConnectionId).uuid().not_null())
                    .col(
                        ColumnDef::new(RetryQueue::OrderId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RetryQueue::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(RetryQueue::WriteDate)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(RetryQueue::Payload).text().not_null())
                    .col(
                        ColumnDef::new(RetryQueue::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(RetryQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(RetryQueue::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(RetryQueue::NextRetryAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RetryQueue::LastError).text().null())
                    .col(
                        ColumnDef::new(RetryQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RetryQueue::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_retry_queue_connection_id")
                            .from(RetryQueue::Table, RetryQueue::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_retry_queue_connection_due")
                    .table(RetryQueue::Table)
                    .col(RetryQueue::ConnectionId)
                    .col(RetryQueue::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        // Partial unique indexes are not expressible through sea-query.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_queue_pending_unique \
                 ON retry_queue (connection_id, order_id) \
                 WHERE status = 'pending'"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_retry_queue_pending_unique".to_string(),
            ))
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_retry_queue_connection_due")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RetryQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RetryQueue {
    Table,
    Id,
    ConnectionId,
    OrderId,
    ExternalId,
    WriteDate,
    Payload,
    Status,
    Attempts,
    MaxAttempts,
    NextRetryAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
