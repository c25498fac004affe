//! Migration to create the sent_orders delivery ledger.
//!
//! The ledger is the authoritative record of delivered orders. The triple
//! `(connection_id, order_id, write_date)` is unique so re-fetched orders
//! are dropped before dispatch.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SentOrders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SentOrders::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SentOrders::ConnectionId).uuid().not_null())
                    .col(
                        ColumnDef::new(SentOrders::OrderId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SentOrders::OrderNumber)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(SentOrders::WriteDate).text().not_null())
                    .col(
                        ColumnDef::new(SentOrders::SentAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sent_orders_connection_id")
                            .from(SentOrders::Table, SentOrders::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sent_orders_unique")
                    .table(SentOrders::Table)
                    .col(SentOrders::ConnectionId)
                    .col(SentOrders::OrderId)
                    .col(SentOrders::WriteDate)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sent_orders_connection")
                    .table(SentOrders::Table)
                    .col(SentOrders::ConnectionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sent_orders_unique").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_sent_orders_connection").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SentOrders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SentOrders {
    Table,
    Id,
    ConnectionId,
    OrderId,
    OrderNumber,
    WriteDate,
    SentAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
