//! Repository for recent join events awaiting the membership/denylist
//! re-check. Rows are marked processed by the sweep and retained as an
//! audit trail, never deleted.

use super::DbError;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct RecentJoiner {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub joined_at: i64,
    pub join_msg_id: Option<i64>,
    pub display_name: String,
    pub processed: bool,
    pub is_spammer: bool,
}

pub struct RecentJoinerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RecentJoinerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        user_id: i64,
        chat_id: i64,
        joined_at: i64,
        join_msg_id: Option<i64>,
        display_name: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO recent_joiners (user_id, chat_id, joined_at, join_msg_id, display_name)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(joined_at)
        .bind(join_msg_id)
        .bind(display_name)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn unprocessed(&self) -> Result<Vec<RecentJoiner>, DbError> {
        let rows = sqlx::query_as::<_, (i64, i64, i64, i64, Option<i64>, String, i64, i64)>(
            r#"
            SELECT id, user_id, chat_id, joined_at, join_msg_id, display_name, processed, is_spammer
            FROM recent_joiners WHERE processed = 0 ORDER BY joined_at
            "#,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, user_id, chat_id, joined_at, join_msg_id, display_name, processed, spam)| {
                    RecentJoiner {
                        id,
                        user_id,
                        chat_id,
                        joined_at,
                        join_msg_id,
                        display_name,
                        processed: processed != 0,
                        is_spammer: spam != 0,
                    }
                },
            )
            .collect())
    }

    pub async fn mark_processed(&self, id: i64, is_spammer: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE recent_joiners SET processed = 1, is_spammer = ? WHERE id = ?")
            .bind(is_spammer as i64)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;

    #[tokio::test]
    async fn sweep_marks_but_never_deletes() {
        let db = Database::open(":memory:").await.unwrap();
        let repo = db.joiners();
        repo.insert(1, -100, 500, Some(3), "alice").await.unwrap();
        repo.insert(2, -100, 501, None, "bob").await.unwrap();

        let pending = repo.unprocessed().await.unwrap();
        assert_eq!(pending.len(), 2);

        repo.mark_processed(pending[0].id, true).await.unwrap();
        let pending = repo.unprocessed().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].display_name, "bob");
    }
}
