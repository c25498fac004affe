//! Delivery ledger entity model
//!
//! One row per successfully delivered (or seeded) order. Rows are never
//! mutated; the unique `(connection_id, order_id, write_date)` triple is the
//! engine's exactly-once guarantee.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::ActiveModelBehavior;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sent_orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub connection_id: Uuid,

    /// Upstream order id
    pub order_id: i64,

    /// Upstream order reference (e.g. `S00042`), kept for operator listings
    pub order_number: String,

    /// Upstream `write_date` at the time of delivery, verbatim
    pub write_date: String,

    pub sent_at: DateTimeWithTimeZone,
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
