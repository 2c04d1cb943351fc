//! Generic key-value rows, used for denylist fetch-timestamp bookkeeping.

use super::DbError;
use sqlx::SqlitePool;

pub struct KvRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> KvRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DbError> {
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Convenience for unix-second timestamps; absent or unparsable values
    /// read as 0 (i.e. "never").
    pub async fn get_ts(&self, key: &str) -> Result<i64, DbError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    pub async fn set_ts(&self, key: &str, ts: i64) -> Result<(), DbError> {
        self.set(key, &ts.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;

    #[tokio::test]
    async fn kv_roundtrip_and_timestamp_defaults() {
        let db = Database::open(":memory:").await.unwrap();
        let kv = db.kv();

        assert_eq!(kv.get("missing").await.unwrap(), None);
        assert_eq!(kv.get_ts("missing").await.unwrap(), 0);

        kv.set("k", "v1").await.unwrap();
        kv.set("k", "v2").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));

        kv.set_ts("last", 1234).await.unwrap();
        assert_eq!(kv.get_ts("last").await.unwrap(), 1234);

        kv.set("garbage", "not-a-number").await.unwrap();
        assert_eq!(kv.get_ts("garbage").await.unwrap(), 0);
    }
}
