//! # Meta Repository
//!
//! Key/value bookkeeping: which store and device own this database, the
//! sync point, and the last sync token.

use sqlx::{SqliteConnection, SqlitePool};

use stockpoint_core::types::SyncToken;

use crate::error::{DbError, DbResult};

pub const STORE_ID: &str = "store_id";
pub const DEVICE_ID: &str = "device_id";
pub const SYNC_POINT: &str = "sync_point";
pub const SYNC_TOKEN: &str = "sync_token";

/// Repository for ledger metadata.
#[derive(Debug, Clone)]
pub struct MetaRepository {
    pool: SqlitePool,
}

impl MetaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MetaRepository { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT meta_value FROM ledger_meta WHERE meta_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set(conn: &mut SqliteConnection, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_meta (meta_key, meta_value) VALUES (?1, ?2)
            ON CONFLICT (meta_key) DO UPDATE SET meta_value = excluded.meta_value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Log version at the last reconciliation, zero before the first.
    pub async fn sync_point(&self) -> DbResult<u64> {
        match self.get(SYNC_POINT).await? {
            Some(value) => value
                .parse()
                .map_err(|_| DbError::corrupt("ledger_meta", format!("bad sync point '{}'", value))),
            None => Ok(0),
        }
    }

    pub async fn sync_token(&self) -> DbResult<Option<SyncToken>> {
        Ok(self.get(SYNC_TOKEN).await?.map(SyncToken))
    }

    pub async fn set_sync_state(
        conn: &mut SqliteConnection,
        sync_point: u64,
        token: Option<&SyncToken>,
    ) -> DbResult<()> {
        Self::set(conn, SYNC_POINT, &sync_point.to_string()).await?;
        if let Some(token) = token {
            Self::set(conn, SYNC_TOKEN, token.as_str()).await?;
        }
        Ok(())
    }

    /// Forgets the sync point and token; identity keys are kept.
    pub async fn clear_sync_state(conn: &mut SqliteConnection) -> DbResult<()> {
        sqlx::query("DELETE FROM ledger_meta WHERE meta_key IN (?1, ?2)")
            .bind(SYNC_POINT)
            .bind(SYNC_TOKEN)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Binds the database to a store and device on first use.
    ///
    /// A database opened for a different store or device is refused.
    pub async fn claim_identity(&self, store_id: &str, device_id: &str) -> DbResult<()> {
        for (key, expected) in [(STORE_ID, store_id), (DEVICE_ID, device_id)] {
            match self.get(key).await? {
                Some(found) if found != expected => {
                    return Err(DbError::IdentityMismatch {
                        key: key.to_string(),
                        expected: expected.to_string(),
                        found,
                    });
                }
                Some(_) => {}
                None => {
                    let mut conn = self.pool.acquire().await?;
                    Self::set(&mut conn, key, expected).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_sync_state_defaults_and_updates() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let meta = db.meta();
        assert_eq!(meta.sync_point().await.unwrap(), 0);
        assert_eq!(meta.sync_token().await.unwrap(), None);

        let mut conn = db.pool().acquire().await.unwrap();
        MetaRepository::set_sync_state(&mut conn, 7, Some(&SyncToken::new("t-7"))).await.unwrap();
        MetaRepository::set_sync_state(&mut conn, 9, None).await.unwrap();
        drop(conn);

        assert_eq!(meta.sync_point().await.unwrap(), 9);
        assert_eq!(meta.sync_token().await.unwrap(), Some(SyncToken::new("t-7")));
    }

    #[tokio::test]
    async fn test_identity_is_claimed_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let meta = db.meta();

        meta.claim_identity("store-1", "device-a").await.unwrap();
        meta.claim_identity("store-1", "device-a").await.unwrap();
        assert!(matches!(
            meta.claim_identity("store-1", "device-b").await,
            Err(DbError::IdentityMismatch { .. })
        ));
    }
}
