//! # Conflict Repository
//!
//! Conflict records are never discarded. A manual resolution rewrites the
//! stored record in place; detection order (`seq`) is preserved.

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use stockpoint_core::types::{ConflictRecord, ConflictResolution};

use super::format_timestamp;
use crate::error::DbResult;

#[derive(Debug, FromRow)]
struct ConflictRow {
    record: String,
}

impl ConflictRow {
    fn into_record(self) -> DbResult<ConflictRecord> {
        Ok(serde_json::from_str(&self.record)?)
    }
}

/// Repository for conflict records.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    /// Inserts a record or replaces the stored one with the same id.
    pub async fn upsert(conn: &mut SqliteConnection, record: &ConflictRecord) -> DbResult<()> {
        let json = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO conflicts (id, sku, resolution, detected_at, resolved_at, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                resolution = excluded.resolution,
                resolved_at = excluded.resolved_at,
                record = excluded.record
            "#,
        )
        .bind(&record.id)
        .bind(&record.sku)
        .bind(record.resolution)
        .bind(format_timestamp(&record.detected_at))
        .bind(record.resolved_at.as_ref().map(format_timestamp))
        .bind(json)
        .execute(&mut *conn)
        .await?;

        debug!(id = %record.id, sku = %record.sku, resolution = %record.resolution, "Conflict stored");
        Ok(())
    }

    pub async fn clear(conn: &mut SqliteConnection) -> DbResult<u64> {
        let removed = sqlx::query("DELETE FROM conflicts")
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(removed)
    }

    /// All records in detection order.
    pub async fn load_all(&self) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as("SELECT record FROM conflicts ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// Manual reviews nobody has resolved yet.
    pub async fn open(&self) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(
            "SELECT record FROM conflicts WHERE resolution = ?1 AND resolved_at IS NULL ORDER BY seq ASC",
        )
        .bind(ConflictResolution::ManualReview)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    pub async fn by_sku(&self, sku: &str) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> =
            sqlx::query_as("SELECT record FROM conflicts WHERE sku = ?1 ORDER BY seq ASC")
                .bind(sku)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<ConflictRecord>> {
        let row: Option<ConflictRow> = sqlx::query_as("SELECT record FROM conflicts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ConflictRow::into_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::{TimeZone, Utc};

    fn review(id: &str, sku: &str) -> ConflictRecord {
        ConflictRecord {
            id: id.into(),
            sku: sku.into(),
            local_operations: vec!["local-1".into()],
            remote_operations: vec!["remote-1".into()],
            resolution: ConflictResolution::ManualReview,
            base_quantity: 8,
            merged_quantity: -5,
            compensations: vec![],
            detected_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            resolved_at: None,
            resolved_by: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_detection_order() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        ConflictRepository::upsert(&mut conn, &review("c-1", "COKE-330")).await.unwrap();
        ConflictRepository::upsert(&mut conn, &review("c-2", "PEPSI-500")).await.unwrap();

        let mut resolved = review("c-1", "COKE-330");
        resolved.resolved_at = Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
        resolved.resolved_by = Some("supervisor-1".into());
        ConflictRepository::upsert(&mut conn, &resolved).await.unwrap();
        drop(conn);

        let repo = db.conflicts();
        let all = repo.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], resolved);

        let open = repo.open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "c-2");

        assert_eq!(repo.by_sku("COKE-330").await.unwrap().len(), 1);
        assert!(repo.get("missing").await.unwrap().is_none());
    }
}
