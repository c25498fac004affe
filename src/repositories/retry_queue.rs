//! Retry queue repository.
//!
//! Failed envelopes are durably parked here. The partial unique index keeps
//! one pending item per `(connection_id, order_id)`; a duplicate enqueue is
//! reported as such so the worker can still treat the order as durably
//! queued.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use super::is_unique_violation;
use crate::models::retry_item::{self, Entity as RetryItem};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_DISCARDED: &str = "discarded";

/// Default delivery attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Parameters for enqueueing a failed envelope.
#[derive(Debug, Clone)]
pub struct NewRetryItem {
    pub connection_id: Uuid,
    pub order_id: i64,
    pub external_id: String,
    pub write_date: String,
    pub payload: String,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Result of an enqueue attempt.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Queued(retry_item::Model),
    /// A pending item for this `(connection, order)` already exists.
    DuplicatePending,
}

/// Repository for the durable retry queue.
#[derive(Debug, Clone)]
pub struct RetryQueueRepository {
    pub db: Arc<DatabaseConnection>,
}

impl RetryQueueRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Enqueues a failed envelope with attempt count 1.
    pub async fn enqueue(&self, item: NewRetryItem) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let active = retry_item::ActiveModel {
            connection_id: Set(item.connection_id),
            order_id: Set(item.order_id),
            external_id: Set(item.external_id),
            write_date: Set(item.write_date),
            payload: Set(item.payload),
            status: Set(STATUS_PENDING.to_string()),
            attempts: Set(1),
            max_attempts: Set(DEFAULT_MAX_ATTEMPTS),
            next_retry_at: Set(item.next_retry_at.into()),
            last_error: Set(item.last_error),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        match active.insert(&*self.db).await {
            Ok(model) => Ok(EnqueueOutcome::Queued(model)),
            Err(err) if is_unique_violation(&err) => Ok(EnqueueOutcome::DuplicatePending),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<retry_item::Model>> {
        Ok(RetryItem::find_by_id(id).one(&*self.db).await?)
    }

    /// Pending items whose retry time has come, in retry order.
    pub async fn due_items(
        &self,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<retry_item::Model>> {
        Ok(RetryItem::find()
            .filter(retry_item::Column::ConnectionId.eq(connection_id))
            .filter(retry_item::Column::Status.eq(STATUS_PENDING))
            .filter(retry_item::Column::NextRetryAt.lte(now))
            .order_by_asc(retry_item::Column::NextRetryAt)
            .order_by_asc(retry_item::Column::Id)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_by_connection(
        &self,
        connection_id: Uuid,
        limit: u64,
    ) -> Result<Vec<retry_item::Model>> {
        Ok(RetryItem::find()
            .filter(retry_item::Column::ConnectionId.eq(connection_id))
            .order_by_desc(retry_item::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<retry_item::Model>> {
        Ok(RetryItem::find()
            .order_by_desc(retry_item::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Marks a delivered item.
    pub async fn mark_success(&self, id: i64) -> Result<()> {
        self.set_status(id, STATUS_SUCCESS, None, None, None).await
    }

    /// Marks an exhausted item; only operator action revives it.
    pub async fn mark_failed(&self, id: i64, last_error: Option<String>) -> Result<()> {
        self.set_status(id, STATUS_FAILED, None, None, last_error)
            .await
    }

    /// Operator discard.
    pub async fn discard(&self, id: i64) -> Result<()> {
        self.set_status(id, STATUS_DISCARDED, None, None, None)
            .await
    }

    /// Records a failed attempt and its next retry time.
    pub async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        self.set_status(
            id,
            STATUS_PENDING,
            Some(attempts),
            Some(next_retry_at),
            last_error,
        )
        .await
    }

    /// Operator retry-now: makes the item due immediately.
    pub async fn force_due(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.set_status(id, STATUS_PENDING, None, Some(now), None)
            .await
    }

    async fn set_status(
        &self,
        id: i64,
        status: &str,
        attempts: Option<i32>,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Result<()> {
        let Some(existing) = self.get(id).await? else {
            return Err(anyhow::anyhow!("retry item '{id}' not found"));
        };

        let mut model: retry_item::ActiveModel = existing.into();
        model.status = Set(status.to_string());
        if let Some(attempts) = attempts {
            model.attempts = Set(attempts);
        }
        if let Some(next_retry_at) = next_retry_at {
            model.next_retry_at = Set(next_retry_at.into());
        }
        if let Some(last_error) = last_error {
            model.last_error = Set(Some(last_error));
        }
        model.updated_at = Set(Utc::now().into());
        model.update(&*self.db).await?;

        Ok(())
    }
}
