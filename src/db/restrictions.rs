//! Repository for time-boxed mute/ban records. Doubles as the audit log and
//! as the source of truth for "is this user currently restricted" without a
//! transport round-trip.

use super::DbError;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    Mute,
    Ban,
}

impl RestrictionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RestrictionKind::Mute => "mute",
            RestrictionKind::Ban => "ban",
        }
    }
}

pub struct RestrictionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RestrictionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: RestrictionKind,
        restricted_at: i64,
        expires_at: i64,
        reason: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO user_restrictions (user_id, chat_id, kind, restricted_at, expires_at, reason)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(kind.as_str())
        .bind(restricted_at)
        .bind(expires_at)
        .bind(reason)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Drop live rows of `kind` for (chat, user); called when a restriction
    /// is lifted early.
    pub async fn clear(
        &self,
        user_id: i64,
        chat_id: i64,
        kind: RestrictionKind,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM user_restrictions WHERE user_id = ? AND chat_id = ? AND kind = ?")
            .bind(user_id)
            .bind(chat_id)
            .bind(kind.as_str())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_restricted(
        &self,
        user_id: i64,
        chat_id: i64,
        now: i64,
    ) -> Result<bool, DbError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_restrictions \
             WHERE user_id = ? AND chat_id = ? AND expires_at > ?",
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(now)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }
}
