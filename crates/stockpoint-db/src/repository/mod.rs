//! # Repository Module
//!
//! Table-level access for the device ledger.
//!
//! ## Read vs Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Reads  (&self, pool)             Writes (associated fns, &mut conn)   │
//! │  ─────────────────────            ────────────────────────────────     │
//! │  db.operations().load_all()       OperationRepository::append(tx, ..)  │
//! │  db.sync_queue().next_pending()   SyncQueueRepository::enqueue(tx, ..)│
//! │  db.conflicts().open()            ConflictRepository::upsert(tx, ..)   │
//! │                                                                         │
//! │  Writes take a connection so LedgerStore can group them into one       │
//! │  transaction: a ledger write either lands entirely or not at all.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`OperationRepository`](operations::OperationRepository) - append-only log
//! - [`ProjectionRepository`](projection::ProjectionRepository) - projection cache
//! - [`SyncQueueRepository`](sync_queue::SyncQueueRepository) - outbox states
//! - [`ConflictRepository`](conflicts::ConflictRepository) - conflict records
//! - [`MetaRepository`](meta::MetaRepository) - identity and sync bookkeeping

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{DbError, DbResult};

pub mod conflicts;
pub mod meta;
pub mod operations;
pub mod projection;
pub mod sync_queue;

/// Stored form of a timestamp (RFC3339, microseconds, `Z`).
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(table: &str, value: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|e| DbError::corrupt(table, format!("bad timestamp '{}': {}", value, e)))
}

/// SQLite integers are signed.
pub(crate) fn to_db_int(value: u64) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| DbError::Internal(format!("{} does not fit in INTEGER", value)))
}

pub(crate) fn from_db_int(table: &str, value: i64) -> DbResult<u64> {
    u64::try_from(value).map_err(|_| DbError::corrupt(table, format!("negative counter {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_round_trip() {
        let timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let text = format_timestamp(&timestamp);

        assert_eq!(text, "2026-03-01T09:30:00.123456Z");
        assert_eq!(parse_timestamp("operations", &text).unwrap(), timestamp);
        assert!(parse_timestamp("operations", "yesterday").is_err());
    }

    #[test]
    fn test_integer_conversion() {
        assert_eq!(to_db_int(42).unwrap(), 42);
        assert!(to_db_int(u64::MAX).is_err());
        assert!(from_db_int("sync_queue", -1).is_err());
    }
}
