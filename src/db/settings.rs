//! Per-chat settings. NULL columns mean "inherit the global default", which
//! is distinct from an explicit zero (e.g. `max_voters = 0` disables the
//! cap on purpose).

use super::DbError;
use crate::config::Defaults;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSettings {
    pub chat_id: i64,
    pub gatekeeper_enabled: bool,
    pub voting_enabled: bool,
    pub challenge_timeout_secs: Option<i64>,
    pub reject_timeout_secs: Option<i64>,
    pub voting_timeout_secs: Option<i64>,
    pub min_voters: Option<i64>,
    pub max_voters: Option<i64>,
    pub min_voters_percent: Option<i64>,
    pub log_channel_id: Option<i64>,
}

impl ChatSettings {
    pub fn challenge_timeout(&self, d: &Defaults) -> i64 {
        self.challenge_timeout_secs.unwrap_or(d.challenge_timeout_secs)
    }

    pub fn reject_timeout(&self, d: &Defaults) -> i64 {
        self.reject_timeout_secs.unwrap_or(d.reject_timeout_secs)
    }

    pub fn voting_timeout(&self, d: &Defaults) -> i64 {
        self.voting_timeout_secs.unwrap_or(d.voting_timeout_secs)
    }

    pub fn min_voters(&self, d: &Defaults) -> i64 {
        self.min_voters.unwrap_or(d.min_voters)
    }

    pub fn max_voters(&self, d: &Defaults) -> i64 {
        self.max_voters.unwrap_or(d.max_voters)
    }

    pub fn min_voters_percent(&self, d: &Defaults) -> i64 {
        self.min_voters_percent.unwrap_or(d.min_voters_percent)
    }
}

pub struct SettingsRepository<'a> {
    pool: &'a SqlitePool,
}

type Row = (
    i64,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
);

impl<'a> SettingsRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Settings for `chat_id`; a chat without a row gets the all-inherit
    /// defaults with both features off.
    pub async fn get(&self, chat_id: i64) -> Result<ChatSettings, DbError> {
        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT chat_id, gatekeeper_enabled, voting_enabled,
                   challenge_timeout_secs, reject_timeout_secs, voting_timeout_secs,
                   min_voters, max_voters, min_voters_percent, log_channel_id
            FROM chat_settings WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(match row {
            Some(r) => ChatSettings {
                chat_id: r.0,
                gatekeeper_enabled: r.1 != 0,
                voting_enabled: r.2 != 0,
                challenge_timeout_secs: r.3,
                reject_timeout_secs: r.4,
                voting_timeout_secs: r.5,
                min_voters: r.6,
                max_voters: r.7,
                min_voters_percent: r.8,
                log_channel_id: r.9,
            },
            None => ChatSettings {
                chat_id,
                ..ChatSettings::default()
            },
        })
    }

    pub async fn upsert(&self, s: &ChatSettings) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chat_settings
                (chat_id, gatekeeper_enabled, voting_enabled,
                 challenge_timeout_secs, reject_timeout_secs, voting_timeout_secs,
                 min_voters, max_voters, min_voters_percent, log_channel_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.chat_id)
        .bind(s.gatekeeper_enabled as i64)
        .bind(s.voting_enabled as i64)
        .bind(s.challenge_timeout_secs)
        .bind(s.reject_timeout_secs)
        .bind(s.voting_timeout_secs)
        .bind(s.min_voters)
        .bind(s.max_voters)
        .bind(s.min_voters_percent)
        .bind(s.log_channel_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}
