//! Migration to create the connections table.
//!
//! One row per configured tenant: upstream credentials (encrypted at rest),
//! downstream webhook target, polling cadence, sync cursor and persisted
//! circuit breaker fields.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::Name).text().not_null())
                    .col(ColumnDef::new(Connections::UpstreamUrl).text().not_null())
                    .col(ColumnDef::new(Connections::UpstreamDb).text().not_null())
                    .col(
                        ColumnDef::new(Connections::UpstreamUsername)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ApiKeyCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Connections::SessionId).big_integer().null())
                    .col(ColumnDef::new(Connections::WebhookUrl).text().not_null())
                    .col(
                        ColumnDef::new(Connections::WebhookSecretCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::StoreId)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Connections::ClientId)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Connections::PollIntervalSeconds)
                            .integer()
                            .not_null()
                            .default(60),
                    )
                    .col(
                        ColumnDef::new(Connections::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Connections::LastSyncAt).text().null())
                    .col(
                        ColumnDef::new(Connections::BreakerState)
                            .text()
                            .not_null()
                            .default("closed"),
                    )
                    .col(
                        ColumnDef::new(Connections::BreakerFailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Connections::BreakerHalfOpenSuccesses)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Connections::BreakerRetryAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_active")
                    .table(Connections::Table)
                    .col(Connections::Active)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_connections_active").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    Name,
    UpstreamUrl,
    UpstreamDb,
    UpstreamUsername,
    ApiKeyCiphertext,
    SessionId,
    WebhookUrl,
    WebhookSecretCiphertext,
    StoreId,
    ClientId,
    PollIntervalSeconds,
    Active,
    LastSyncAt,
    BreakerState,
    BreakerFailureCount,
    BreakerHalfOpenSuccesses,
    BreakerRetryAt,
    CreatedAt,
    UpdatedAt,
}
