//! Retry queue entity model
//!
//! Durable copy of an envelope whose webhook delivery failed. At most one
//! pending item may exist per `(connection_id, order_id)`.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::ActiveModelBehavior;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "retry_queue")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub connection_id: Uuid,

    /// Upstream order id
    pub order_id: i64,

    /// Stable downstream idempotency key: `upstream_{db}_{order_id}`
    pub external_id: String,

    /// Upstream `write_date` of the order, carried so a late delivery can
    /// still mark the ledger triple
    pub write_date: String,

    /// Serialized envelope JSON
    pub payload: String,

    /// `pending`, `success`, `failed` or `discarded`
    pub status: String,

    /// Delivery attempts so far; the original failed dispatch counts as 1
    pub attempts: i32,

    pub max_attempts: i32,

    pub next_retry_at: DateTimeWithTimeZone,

    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
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
