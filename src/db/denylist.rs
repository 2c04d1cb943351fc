//! Persisted denylist mirror: bulk upsert after a fetch, full read to
//! rebuild the in-memory snapshot. Ids are only ever added; external lists
//! are treated as append-only.

use super::DbError;
use sqlx::SqlitePool;

pub struct DenylistRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DenylistRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge `ids` into the persisted set in one transaction.
    pub async fn upsert_many(&self, ids: &[i64]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("INSERT OR IGNORE INTO denylist (user_id) VALUES (?)")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<i64>, DbError> {
        let rows = sqlx::query_as::<_, (i64,)>("SELECT user_id FROM denylist")
            .fetch_all(self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
