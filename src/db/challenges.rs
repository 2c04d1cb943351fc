//! Repository for pending join challenges.
//!
//! Keyed by (communication chat, user): the chat where the captcha message
//! lives, which differs from the target chat for join-request flows. At most
//! one live challenge per key; a re-join replaces the prior row.

use super::DbError;
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub comm_chat_id: i64,
    pub user_id: i64,
    pub target_chat_id: i64,
    pub success_token: String,
    pub join_msg_id: Option<i64>,
    pub challenge_msg_id: Option<i64>,
    pub attempts: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Challenge {
    /// Join-request flows run the captcha in the user's private chat, not
    /// in the chat being joined.
    pub fn is_join_request(&self) -> bool {
        self.comm_chat_id != self.target_chat_id
    }
}

pub struct ChallengeRepository<'a> {
    pool: &'a SqlitePool,
}

type Row = (
    i64,
    i64,
    i64,
    String,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
    i64,
);

fn from_row(r: Row) -> Challenge {
    Challenge {
        comm_chat_id: r.0,
        user_id: r.1,
        target_chat_id: r.2,
        success_token: r.3,
        join_msg_id: r.4,
        challenge_msg_id: r.5,
        attempts: r.6,
        created_at: r.7,
        expires_at: r.8,
    }
}

const COLUMNS: &str = "comm_chat_id, user_id, target_chat_id, success_token, \
                       join_msg_id, challenge_msg_id, attempts, created_at, expires_at";

impl<'a> ChallengeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the challenge for (comm chat, user).
    pub async fn upsert(&self, ch: &Challenge) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO challenges
                (comm_chat_id, user_id, target_chat_id, success_token,
                 join_msg_id, challenge_msg_id, attempts, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ch.comm_chat_id)
        .bind(ch.user_id)
        .bind(ch.target_chat_id)
        .bind(&ch.success_token)
        .bind(ch.join_msg_id)
        .bind(ch.challenge_msg_id)
        .bind(ch.attempts)
        .bind(ch.created_at)
        .bind(ch.expires_at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, comm_chat_id: i64, user_id: i64) -> Result<Option<Challenge>, DbError> {
        let row = sqlx::query_as::<_, Row>(&format!(
            "SELECT {COLUMNS} FROM challenges WHERE comm_chat_id = ? AND user_id = ?"
        ))
        .bind(comm_chat_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(from_row))
    }

    /// Delete the row. Returns false when it was already gone, which callers
    /// treat as a resolved race, not an error.
    pub async fn delete(&self, comm_chat_id: i64, user_id: i64) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM challenges WHERE comm_chat_id = ? AND user_id = ?")
            .bind(comm_chat_id)
            .bind(user_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_message_id(
        &self,
        comm_chat_id: i64,
        user_id: i64,
        challenge_msg_id: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE challenges SET challenge_msg_id = ? WHERE comm_chat_id = ? AND user_id = ?",
        )
        .bind(challenge_msg_id)
        .bind(comm_chat_id)
        .bind(user_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_attempts(
        &self,
        comm_chat_id: i64,
        user_id: i64,
        attempts: i64,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE challenges SET attempts = ? WHERE comm_chat_id = ? AND user_id = ?")
            .bind(attempts)
            .bind(comm_chat_id)
            .bind(user_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// All challenges whose deadline has passed, for the expiry sweep.
    pub async fn expired(&self, now: i64) -> Result<Vec<Challenge>, DbError> {
        let rows = sqlx::query_as::<_, Row>(&format!(
            "SELECT {COLUMNS} FROM challenges WHERE expires_at <= ?"
        ))
        .bind(now)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }
}
