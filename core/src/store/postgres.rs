//! Postgres-backed state store
//!
//! One row per partition record in `bot_state`. Conditional writes run in a
//! single transaction; a write whose condition matches no row rolls the
//! whole batch back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ETag, Precondition, StateStore, StoreError, Versioned, Write};
use crate::state::{Partition, StateKey};

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Every key stored for a partition, most recently updated first
    pub async fn list(
        &self,
        partition: Partition,
        limit: i64,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, updated_at
            FROM bot_state
            WHERE partition = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(partition.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, StoreError> {
                Ok((row.try_get("key")?, row.try_get("updated_at")?))
            })
            .collect()
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, keys: &[StateKey]) -> Result<Vec<Option<Versioned>>, StoreError> {
        let partitions: Vec<String> = keys.iter().map(|k| k.partition.to_string()).collect();
        let names: Vec<String> = keys.iter().map(|k| k.key.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT s.partition, s.key, s.data, s.etag, s.updated_at
            FROM bot_state s
            JOIN UNNEST($1::text[], $2::text[]) AS k(partition, key)
              ON s.partition = k.partition AND s.key = k.key
            "#,
        )
        .bind(&partitions)
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        let mut found: HashMap<(String, String), Versioned> = HashMap::with_capacity(rows.len());
        for row in rows {
            let partition: String = row.try_get("partition")?;
            let key: String = row.try_get("key")?;
            let etag: Uuid = row.try_get("etag")?;
            found.insert(
                (partition, key),
                Versioned {
                    data: row.try_get::<JsonValue, _>("data")?,
                    etag: ETag::from_uuid(etag),
                    updated_at: row.try_get("updated_at")?,
                },
            );
        }

        Ok(keys
            .iter()
            .map(|k| found.remove(&(k.partition.as_str().to_string(), k.key.clone())))
            .collect())
    }

    async fn save(&self, writes: Vec<Write>) -> Result<Vec<ETag>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut etags = Vec::with_capacity(writes.len());

        for write in writes {
            let etag = ETag::new();
            let applied = write_one(&mut tx, &write, etag).await?;
            if !applied {
                warn!(key = %write.key, "Conditional write rejected, rolling back");
                tx.rollback().await?;
                return Err(StoreError::Conflict { key: write.key });
            }
            etags.push(etag);
        }

        tx.commit().await?;
        debug!(records = etags.len(), "Saved state");
        Ok(etags)
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM bot_state WHERE partition = $1 AND key = $2")
            .bind(key.partition.as_str())
            .bind(&key.key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Apply one write. Returns false if its precondition did not hold.
async fn write_one(
    tx: &mut Transaction<'_, Postgres>,
    write: &Write,
    etag: ETag,
) -> Result<bool, StoreError> {
    let partition = write.key.partition.as_str();

    let result = match write.precondition {
        Precondition::Any => {
            sqlx::query(
                r#"
                INSERT INTO bot_state (partition, key, data, etag, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (partition, key)
                DO UPDATE SET data = EXCLUDED.data, etag = EXCLUDED.etag, updated_at = NOW()
                "#,
            )
            .bind(partition)
            .bind(&write.key.key)
            .bind(&write.data)
            .bind(etag.as_uuid())
            .execute(&mut **tx)
            .await?
        }
        Precondition::Absent => {
            sqlx::query(
                r#"
                INSERT INTO bot_state (partition, key, data, etag, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (partition, key) DO NOTHING
                "#,
            )
            .bind(partition)
            .bind(&write.key.key)
            .bind(&write.data)
            .bind(etag.as_uuid())
            .execute(&mut **tx)
            .await?
        }
        Precondition::Matches(expected) => {
            sqlx::query(
                r#"
                UPDATE bot_state
                SET data = $3, etag = $4, updated_at = NOW()
                WHERE partition = $1 AND key = $2 AND etag = $5
                "#,
            )
            .bind(partition)
            .bind(&write.key.key)
            .bind(&write.data)
            .bind(etag.as_uuid())
            .bind(expected.as_uuid())
            .execute(&mut **tx)
            .await?
        }
    };

    Ok(result.rows_affected() == 1)
}
