//! Upstream RPC integration.
//!
//! [`client::UpstreamClient`] speaks the upstream's JSON-RPC dialect and
//! caches the authenticated session; [`record::Record`] is the typed seam
//! over the string-keyed rows the upstream returns.

pub mod client;
pub mod record;

pub use client::{UpstreamClient, UpstreamError};
pub use record::Record;

use chrono::{DateTime, Utc};

/// Timestamp layout used by the upstream for `write_date`/`date_order`
/// fields. Lexicographic order on these strings matches chronological order,
/// which is what the cursor comparisons rely on.
pub const WRITE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats an instant in the upstream's `write_date` layout.
pub fn format_write_date(at: DateTime<Utc>) -> String {
    at.format(WRITE_DATE_FORMAT).to_string()
}
