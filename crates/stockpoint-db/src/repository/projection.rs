//! # Projection Repository
//!
//! Cache of the Local Projection. The cache is only a shortcut for startup:
//! every row carries the log version it was written at, and a cache whose
//! `snapshot_version` disagrees with the log is ignored and replayed.

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use stockpoint_core::types::ProjectionEntry;

use super::{from_db_int, to_db_int};
use crate::error::DbResult;

const TABLE: &str = "projection_cache";

#[derive(Debug, FromRow)]
struct ProjectionRow {
    sku: String,
    quantity: i64,
    last_operation_id: Option<String>,
    version: i64,
    needs_attention: bool,
    snapshot_version: i64,
}

/// Repository for the projection cache.
#[derive(Debug, Clone)]
pub struct ProjectionRepository {
    pool: SqlitePool,
}

impl ProjectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProjectionRepository { pool }
    }

    /// Upserts `entries` and stamps the whole cache with `snapshot_version`.
    pub async fn save(
        conn: &mut SqliteConnection,
        entries: &[ProjectionEntry],
        snapshot_version: u64,
    ) -> DbResult<()> {
        let snapshot_version = to_db_int(snapshot_version)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO projection_cache (
                    sku, quantity, last_operation_id, version, needs_attention, snapshot_version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (sku) DO UPDATE SET
                    quantity = excluded.quantity,
                    last_operation_id = excluded.last_operation_id,
                    version = excluded.version,
                    needs_attention = excluded.needs_attention,
                    snapshot_version = excluded.snapshot_version
                "#,
            )
            .bind(&entry.sku)
            .bind(entry.quantity)
            .bind(&entry.last_operation_id)
            .bind(to_db_int(entry.version)?)
            .bind(entry.needs_attention)
            .bind(snapshot_version)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("UPDATE projection_cache SET snapshot_version = ?1")
            .bind(snapshot_version)
            .execute(&mut *conn)
            .await?;

        debug!(changed = entries.len(), snapshot_version, "Projection cache saved");
        Ok(())
    }

    /// Replaces the whole cache, e.g. after a rebuild.
    pub async fn replace(
        conn: &mut SqliteConnection,
        entries: &[ProjectionEntry],
        snapshot_version: u64,
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM projection_cache")
            .execute(&mut *conn)
            .await?;
        Self::save(conn, entries, snapshot_version).await
    }

    /// Cached entries and the log version they reflect.
    ///
    /// `None` when rows disagree on their snapshot version.
    pub async fn load(&self) -> DbResult<Option<(Vec<ProjectionEntry>, u64)>> {
        let rows: Vec<ProjectionRow> = sqlx::query_as(
            r#"
            SELECT sku, quantity, last_operation_id, version, needs_attention, snapshot_version
            FROM projection_cache
            ORDER BY sku ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(Some((Vec::new(), 0)));
        };
        let snapshot_version = first.snapshot_version;
        if rows.iter().any(|row| row.snapshot_version != snapshot_version) {
            return Ok(None);
        }

        let entries = rows
            .into_iter()
            .map(|row| {
                Ok(ProjectionEntry {
                    version: from_db_int(TABLE, row.version)?,
                    sku: row.sku,
                    quantity: row.quantity,
                    last_operation_id: row.last_operation_id,
                    needs_attention: row.needs_attention,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        Ok(Some((entries, from_db_int(TABLE, snapshot_version)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn entry(sku: &str, quantity: i64, version: u64) -> ProjectionEntry {
        ProjectionEntry {
            sku: sku.into(),
            quantity,
            last_operation_id: Some(format!("op-{}", version)),
            version,
            needs_attention: quantity < 0,
        }
    }

    #[tokio::test]
    async fn test_save_stamps_every_row() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        ProjectionRepository::save(&mut conn, &[entry("COKE-330", 8, 1), entry("PEPSI-500", 3, 2)], 2)
            .await
            .unwrap();
        ProjectionRepository::save(&mut conn, &[entry("COKE-330", -1, 3)], 3)
            .await
            .unwrap();
        drop(conn);

        let (entries, version) = db.projection().load().await.unwrap().unwrap();
        assert_eq!(version, 3);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].quantity, -1);
        assert!(entries[0].needs_attention);
        assert_eq!(entries[1].quantity, 3);
    }

    #[tokio::test]
    async fn test_empty_cache_is_version_zero() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(db.projection().load().await.unwrap(), Some((Vec::new(), 0)));
    }
}
