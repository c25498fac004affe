//! Sync log entity model
//!
//! Append-only observability record, one row per poll cycle.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::ActiveModelBehavior;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub connection_id: Uuid,

    pub started_at: DateTimeWithTimeZone,

    pub orders_found: i32,
    pub orders_sent: i32,
    pub orders_failed: i32,
    pub orders_skipped: i32,

    pub duration_ms: i64,

    pub error_message: Option<String>,

    /// Breaker state when the cycle was gated
    pub breaker_state_entry: String,

    /// Breaker state after the cycle finalized
    pub breaker_state_exit: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
