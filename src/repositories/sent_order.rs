//! Delivery ledger repository.
//!
//! `mark_sent` is conflict-ignoring: the ledger's unique triple absorbs any
//! race between the fresh-dispatch path and a retry sweep, and re-marking an
//! already delivered order is a no-op rather than an error.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, Statement,
};
use uuid::Uuid;

use crate::models::sent_order::{self, Entity as SentOrder};

/// Ledger rows kept per connection; older rows are trimmed each cycle.
pub const LEDGER_LIMIT: u64 = 30;

/// Repository for the sent_orders delivery ledger.
#[derive(Debug, Clone)]
pub struct SentOrderRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SentOrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Records a delivery. Conflicts on the unique triple are ignored.
    pub async fn mark_sent(
        &self,
        connection_id: Uuid,
        order_id: i64,
        order_number: &str,
        write_date: &str,
    ) -> Result<()> {
        let active = sent_order::ActiveModel {
            connection_id: Set(connection_id),
            order_id: Set(order_id),
            order_number: Set(order_number.to_string()),
            write_date: Set(write_date.to_string()),
            sent_at: Set(Utc::now().into()),
            ..Default::default()
        };

        let insert = SentOrder::insert(active).on_conflict(
            OnConflict::columns([
                sent_order::Column::ConnectionId,
                sent_order::Column::OrderId,
                sent_order::Column::WriteDate,
            ])
            .do_nothing()
            .to_owned(),
        );

        match insert.exec(&*self.db).await {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a delivery is already ledgered.
    pub async fn was_sent(
        &self,
        connection_id: Uuid,
        order_id: i64,
        write_date: &str,
    ) -> Result<bool> {
        let found = SentOrder::find()
            .filter(sent_order::Column::ConnectionId.eq(connection_id))
            .filter(sent_order::Column::OrderId.eq(order_id))
            .filter(sent_order::Column::WriteDate.eq(write_date))
            .one(&*self.db)
            .await?;
        Ok(found.is_some())
    }

    /// All `(order_id, write_date)` pairs ledgered for a connection, used
    /// for one-query candidate dedupe.
    pub async fn sent_keys(&self, connection_id: Uuid) -> Result<HashSet<(i64, String)>> {
        let rows: Vec<(i64, String)> = SentOrder::find()
            .select_only()
            .column(sent_order::Column::OrderId)
            .column(sent_order::Column::WriteDate)
            .filter(sent_order::Column::ConnectionId.eq(connection_id))
            .into_tuple()
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Most recent ledger rows, newest first.
    pub async fn list_by_connection(
        &self,
        connection_id: Uuid,
        limit: u64,
    ) -> Result<Vec<sent_order::Model>> {
        Ok(SentOrder::find()
            .filter(sent_order::Column::ConnectionId.eq(connection_id))
            .order_by_desc(sent_order::Column::SentAt)
            .order_by_desc(sent_order::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Removes the oldest rows beyond the most recent `limit` by sent-at.
    pub async fn trim_to_limit(&self, connection_id: Uuid, limit: u64) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            "DELETE FROM sent_orders WHERE connection_id = ? AND id NOT IN ( \
                 SELECT id FROM sent_orders WHERE connection_id = ? \
                 ORDER BY sent_at DESC, id DESC LIMIT ? \
             )",
            vec![
                connection_id.into(),
                connection_id.into(),
                (limit as i64).into(),
            ],
        );

        self.db.execute(stmt).await?;
        Ok(())
    }
}
