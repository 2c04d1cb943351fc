//! Repositories for spam cases and their votes.
//!
//! A case is `pending` until resolved; at most one pending case per
//! (chat, user) is enforced by looking up before creating. Votes are
//! upserts: a voter may change their mind until resolution.

use super::DbError;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Pending,
    Spam,
    FalsePositive,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Spam => "spam",
            CaseStatus::FalsePositive => "false_positive",
        }
    }

    fn parse(s: &str) -> CaseStatus {
        match s {
            "spam" => CaseStatus::Spam,
            "false_positive" => CaseStatus::FalsePositive,
            _ => CaseStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpamCase {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub message_text: String,
    pub created_at: i64,
    pub channel_msg_id: Option<i64>,
    pub notif_msg_id: Option<i64>,
    pub status: CaseStatus,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteTally {
    /// "not spam" votes
    pub yes: i64,
    /// "spam" votes
    pub no: i64,
}

impl VoteTally {
    pub fn total(&self) -> i64 {
        self.yes + self.no
    }
}

pub struct SpamCaseRepository<'a> {
    pool: &'a SqlitePool,
}

type CaseRow = (
    i64,
    i64,
    i64,
    String,
    i64,
    Option<i64>,
    Option<i64>,
    String,
    Option<i64>,
);

fn case_from_row(r: CaseRow) -> SpamCase {
    SpamCase {
        id: r.0,
        chat_id: r.1,
        user_id: r.2,
        message_text: r.3,
        created_at: r.4,
        channel_msg_id: r.5,
        notif_msg_id: r.6,
        status: CaseStatus::parse(&r.7),
        resolved_at: r.8,
    }
}

const CASE_COLUMNS: &str = "id, chat_id, user_id, message_text, created_at, \
                            channel_msg_id, notif_msg_id, status, resolved_at";

impl<'a> SpamCaseRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Reuse the pending case for (chat, user) if there is one, otherwise
    /// create a fresh one capturing the message text.
    pub async fn get_or_create(
        &self,
        chat_id: i64,
        user_id: i64,
        message_text: &str,
        now: i64,
    ) -> Result<SpamCase, DbError> {
        if let Some(existing) = self.pending_for(chat_id, user_id).await? {
            return Ok(existing);
        }
        let id = sqlx::query(
            r#"
            INSERT INTO spam_cases (chat_id, user_id, message_text, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(message_text)
        .bind(now)
        .execute(self.pool)
        .await?
        .last_insert_rowid();
        Ok(SpamCase {
            id,
            chat_id,
            user_id,
            message_text: message_text.to_string(),
            created_at: now,
            channel_msg_id: None,
            notif_msg_id: None,
            status: CaseStatus::Pending,
            resolved_at: None,
        })
    }

    pub async fn pending_for(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<SpamCase>, DbError> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM spam_cases \
             WHERE chat_id = ? AND user_id = ? AND status = 'pending'"
        ))
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(case_from_row))
    }

    pub async fn get(&self, id: i64) -> Result<Option<SpamCase>, DbError> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM spam_cases WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(case_from_row))
    }

    pub async fn set_channel_msg(&self, id: i64, msg_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE spam_cases SET channel_msg_id = ? WHERE id = ?")
            .bind(msg_id)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_notif_msg(&self, id: i64, msg_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE spam_cases SET notif_msg_id = ? WHERE id = ?")
            .bind(msg_id)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Move a pending case to a terminal status. Returns false when the case
    /// was not pending (already resolved by a racing path) — a no-op for
    /// callers.
    pub async fn resolve(&self, id: i64, status: CaseStatus, now: i64) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE spam_cases SET status = ?, resolved_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Message texts of recently confirmed spam, newest first, fed to the
    /// classifier as prior examples.
    pub async fn recent_spam_examples(&self, limit: i64) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT message_text FROM spam_cases WHERE status = 'spam' \
             ORDER BY resolved_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

pub struct SpamVoteRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SpamVoteRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record or replace this voter's vote. `vote == true` means "not spam".
    pub async fn upsert(
        &self,
        case_id: i64,
        voter_id: i64,
        vote: bool,
        now: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO spam_votes (case_id, voter_id, vote, voted_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(case_id)
        .bind(voter_id)
        .bind(vote as i64)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn tally(&self, case_id: i64) -> Result<VoteTally, DbError> {
        let (yes, no) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN vote = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN vote = 0 THEN 1 ELSE 0 END), 0)
            FROM spam_votes WHERE case_id = ?
            "#,
        )
        .bind(case_id)
        .fetch_one(self.pool)
        .await?;
        Ok(VoteTally { yes, no })
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use super::*;

    #[tokio::test]
    async fn pending_case_is_reused() {
        let db = Database::open(":memory:").await.unwrap();
        let cases = db.spam_cases();

        let a = cases.get_or_create(-5, 9, "buy crypto", 100).await.unwrap();
        let b = cases.get_or_create(-5, 9, "another text", 101).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.message_text, "buy crypto");

        // resolution frees the slot
        assert!(cases.resolve(a.id, CaseStatus::Spam, 102).await.unwrap());
        let c = cases.get_or_create(-5, 9, "third", 103).await.unwrap();
        assert_ne!(c.id, a.id);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        let cases = db.spam_cases();
        let case = cases.get_or_create(-1, 1, "x", 10).await.unwrap();
        assert!(cases.resolve(case.id, CaseStatus::FalsePositive, 11).await.unwrap());
        assert!(!cases.resolve(case.id, CaseStatus::Spam, 12).await.unwrap());

        let got = cases.get(case.id).await.unwrap().unwrap();
        assert_eq!(got.status, CaseStatus::FalsePositive);
        assert_eq!(got.resolved_at, Some(11));
    }

    #[tokio::test]
    async fn votes_upsert_per_voter() {
        let db = Database::open(":memory:").await.unwrap();
        let votes = db.spam_votes();

        votes.upsert(1, 100, false, 10).await.unwrap();
        votes.upsert(1, 101, false, 11).await.unwrap();
        votes.upsert(1, 100, true, 12).await.unwrap(); // changed their mind

        let t = votes.tally(1).await.unwrap();
        assert_eq!(t, VoteTally { yes: 1, no: 1 });
        assert_eq!(t.total(), 2);
    }

    #[tokio::test]
    async fn spam_examples_come_back_newest_first() {
        let db = Database::open(":memory:").await.unwrap();
        let cases = db.spam_cases();
        let a = cases.get_or_create(-1, 1, "old spam", 10).await.unwrap();
        cases.resolve(a.id, CaseStatus::Spam, 20).await.unwrap();
        let b = cases.get_or_create(-1, 2, "new spam", 15).await.unwrap();
        cases.resolve(b.id, CaseStatus::Spam, 30).await.unwrap();
        let c = cases.get_or_create(-1, 3, "ham", 16).await.unwrap();
        cases.resolve(c.id, CaseStatus::FalsePositive, 31).await.unwrap();

        let examples = cases.recent_spam_examples(10).await.unwrap();
        assert_eq!(examples, vec!["new spam".to_string(), "old spam".to_string()]);
    }
}
