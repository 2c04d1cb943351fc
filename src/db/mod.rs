//! Persistent storage: async SQLite via SQLx with embedded migrations.
//!
//! One repository struct per table. All timestamps are unix seconds.

mod challenges;
mod denylist;
mod joiners;
mod kv;
mod restrictions;
mod settings;
mod spam;

pub use challenges::{Challenge, ChallengeRepository};
pub use denylist::DenylistRepository;
pub use joiners::{RecentJoiner, RecentJoinerRepository};
pub use kv::KvRepository;
pub use restrictions::{RestrictionKind, RestrictionRepository};
pub use settings::{ChatSettings, SettingsRepository};
pub use spam::{CaseStatus, SpamCase, SpamCaseRepository, SpamVoteRepository, VoteTally};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (or create) the database at `path`, running migrations.
    /// `":memory:"` gives a uniquely named in-memory database so parallel
    /// tests do not collide on the shared-cache default.
    pub async fn open(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uri = format!(
                "file:tg-warden-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );
            let options = SqliteConnectOptions::new()
                .filename(&uri)
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e,
                            "failed to create database directory");
                    }
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        };

        sqlx::migrate!("./migrations").run(&pool).await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        info!(path = %path, "database ready");

        Ok(Self { pool })
    }

    pub fn challenges(&self) -> ChallengeRepository<'_> {
        ChallengeRepository::new(&self.pool)
    }

    pub fn joiners(&self) -> RecentJoinerRepository<'_> {
        RecentJoinerRepository::new(&self.pool)
    }

    pub fn spam_cases(&self) -> SpamCaseRepository<'_> {
        SpamCaseRepository::new(&self.pool)
    }

    pub fn spam_votes(&self) -> SpamVoteRepository<'_> {
        SpamVoteRepository::new(&self.pool)
    }

    pub fn restrictions(&self) -> RestrictionRepository<'_> {
        RestrictionRepository::new(&self.pool)
    }

    pub fn settings(&self) -> SettingsRepository<'_> {
        SettingsRepository::new(&self.pool)
    }

    pub fn denylist(&self) -> DenylistRepository<'_> {
        DenylistRepository::new(&self.pool)
    }

    pub fn kv(&self) -> KvRepository<'_> {
        KvRepository::new(&self.pool)
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
