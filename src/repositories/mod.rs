//! Repositories encapsulating all access to the durable store.
//!
//! Every component reads and writes through these; the store is the only
//! cross-task shared resource. Credential encryption lives behind the
//! connection repository, so callers always see cleartext secrets.

pub mod connection;
pub mod retry_queue;
pub mod sent_order;
pub mod sync_log;

pub use connection::ConnectionRepository;
pub use retry_queue::RetryQueueRepository;
pub use sent_order::SentOrderRepository;
pub use sync_log::SyncLogRepository;

use sea_orm::{DbErr, RuntimeErr};

/// Detects a unique-constraint violation across the supported backends.
pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err))) => {
            matches!(db_err.code().as_deref(), Some("23505") | Some("2067") | Some("1555"))
        }
        _ => false,
    }
}
