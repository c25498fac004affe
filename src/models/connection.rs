//! Connection entity model
//!
//! One row per configured tenant: upstream credentials (encrypted at rest),
//! webhook target, polling cadence, the sync cursor and the persisted
//! circuit breaker fields.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::ActiveModelBehavior;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Operator-facing display name
    pub name: String,

    /// Base URL of the upstream instance
    pub upstream_url: String,

    /// Upstream database identifier
    pub upstream_db: String,

    /// Upstream login user
    pub upstream_username: String,

    /// Encrypted upstream API key
    pub api_key_ciphertext: Vec<u8>,

    /// Cached upstream session identifier, refreshed on authentication
    pub session_id: Option<i64>,

    /// Downstream webhook endpoint
    pub webhook_url: String,

    /// Encrypted webhook shared secret (optional)
    pub webhook_secret_ciphertext: Option<Vec<u8>>,

    /// Opaque downstream store correlation key, echoed in every envelope
    pub store_id: String,

    /// Opaque downstream client correlation key, echoed in every envelope
    pub client_id: String,

    /// Seconds between poll cycles
    pub poll_interval_seconds: i32,

    /// Whether the scheduler runs a task for this connection
    pub active: bool,

    /// High-water mark: the largest upstream `write_date` observed, kept in
    /// the upstream's own timestamp format (lexicographically ordered).
    /// `None` means the connection has not seeded yet.
    pub last_sync_at: Option<String>,

    /// Breaker state: `closed`, `open` or `half_open`
    pub breaker_state: String,

    /// Consecutive hard failure count
    pub breaker_failure_count: i32,

    /// Probe successes accumulated while half-open
    pub breaker_half_open_successes: i32,

    /// Earliest instant an open breaker admits a probe cycle
    pub breaker_retry_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sent_order::Entity")]
    SentOrders,
    #[sea_orm(has_many = "super::retry_item::Entity")]
    RetryItems,
    #[sea_orm(has_many = "super::sync_log::Entity")]
    SyncLogs,
}

impl Related<super::sent_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SentOrders.def()
    }
}

impl Related<super::retry_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RetryItems.def()
    }
}

impl Related<super::sync_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
