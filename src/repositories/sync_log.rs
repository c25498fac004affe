//! Sync log repository.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::models::sync_log::{self, Entity as SyncLog};

/// One cycle's observable outcome.
#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub connection_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub orders_found: i32,
    pub orders_sent: i32,
    pub orders_failed: i32,
    pub orders_skipped: i32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub breaker_state_entry: String,
    pub breaker_state_exit: String,
}

/// Repository for the append-only sync_logs table.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncLogRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn append(&self, log: NewSyncLog) -> Result<sync_log::Model> {
        let active = sync_log::ActiveModel {
            connection_id: Set(log.connection_id),
            started_at: Set(log.started_at.into()),
            orders_found: Set(log.orders_found),
            orders_sent: Set(log.orders_sent),
            orders_failed: Set(log.orders_failed),
            orders_skipped: Set(log.orders_skipped),
            duration_ms: Set(log.duration_ms),
            error_message: Set(log.error_message),
            breaker_state_entry: Set(log.breaker_state_entry),
            breaker_state_exit: Set(log.breaker_state_exit),
            ..Default::default()
        };

        Ok(active.insert(&*self.db).await?)
    }

    pub async fn list_by_connection(
        &self,
        connection_id: Uuid,
        limit: u64,
    ) -> Result<Vec<sync_log::Model>> {
        Ok(SyncLog::find()
            .filter(sync_log::Column::ConnectionId.eq(connection_id))
            .order_by_desc(sync_log::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<sync_log::Model>> {
        Ok(SyncLog::find()
            .order_by_desc(sync_log::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }
}
