//! Denylist sync: mirrors external plaintext id lists into storage and an
//! in-memory snapshot.
//!
//! Two cadences run against the same tables: a daily full refresh (all
//! configured source lists merged) and an hourly incremental one. Fetched
//! ids are merged into the persisted set, then the whole persisted set is
//! reloaded and swapped into the cache in one write, so a reader never sees
//! a partially applied update. Point lookups fall back to a live per-user
//! status endpoint and memoize positives in the cache only.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::DenylistConfig;
use crate::db::{now_ts, Database};

const KEY_LAST_DAILY: &str = "denylist:last_daily";
const KEY_LAST_HOURLY: &str = "denylist:last_hourly";

const DAILY_STALE_SECS: i64 = 24 * 3600;
const HOURLY_STALE_SECS: i64 = 3600;

const MAX_FETCH_ATTEMPTS: u64 = 3;
const DEFAULT_BACKOFF_STEP_SECS: u64 = 5;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("shutdown requested")]
    Cancelled,
    #[error("fetch failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u64, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Daily,
    Hourly,
    Skip,
}

/// Which refresh the bootstrap should run, from persisted last-fetch times.
pub fn bootstrap_kind(now: i64, last_daily: i64, last_hourly: i64) -> SyncKind {
    if now - last_daily >= DAILY_STALE_SECS {
        SyncKind::Daily
    } else if now - last_hourly >= HOURLY_STALE_SECS {
        SyncKind::Hourly
    } else {
        SyncKind::Skip
    }
}

/// Linear backoff: `attempt * step`, attempts counted from 1.
pub fn backoff_delay(attempt: u64, step_secs: u64) -> Duration {
    Duration::from_secs(attempt * step_secs)
}

/// Newline-delimited user ids; anything non-numeric is skipped.
pub fn parse_id_list(body: &str) -> Vec<i64> {
    body.lines()
        .filter_map(|line| line.trim().parse::<i64>().ok())
        .collect()
}

#[derive(Debug, Deserialize)]
struct BanStatus {
    ok: bool,
    #[serde(default)]
    banned: bool,
}

pub struct DenylistService {
    db: Database,
    http: reqwest::Client,
    cfg: DenylistConfig,
    cache: RwLock<HashSet<i64>>,
}

impl DenylistService {
    pub fn new(db: Database, cfg: DenylistConfig) -> Self {
        let timeout = Duration::from_secs(cfg.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            db,
            http,
            cfg,
            cache: RwLock::new(HashSet::new()),
        }
    }

    // ---- cache ----

    pub fn is_known_banned(&self, user_id: i64) -> bool {
        self.cache.read().unwrap().contains(&user_id)
    }

    /// Replace the whole snapshot. Copies the input, so later mutation of
    /// the caller's set cannot bleed into lookups.
    pub fn set_known_banned(&self, ids: &HashSet<i64>) {
        let snapshot = ids.clone();
        *self.cache.write().unwrap() = snapshot;
    }

    fn memoize(&self, user_id: i64) {
        self.cache.write().unwrap().insert(user_id);
    }

    /// Rebuild the snapshot from the persisted set.
    pub async fn reload_cache(&self) -> anyhow::Result<()> {
        let ids: HashSet<i64> = self.db.denylist().all().await?.into_iter().collect();
        let n = ids.len();
        *self.cache.write().unwrap() = ids;
        debug!(entries = n, "denylist cache reloaded");
        Ok(())
    }

    // ---- lookups ----

    /// Cache first; on a miss, ask the live status endpoint and memoize a
    /// positive answer (cache only, not persisted).
    pub async fn check_ban(&self, user_id: i64) -> bool {
        if self.is_known_banned(user_id) {
            return true;
        }
        let Some(url) = self.cfg.status_url.as_deref() else {
            return false;
        };
        let url = format!("{url}?user_id={user_id}");
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<BanStatus>().await {
                Ok(status) if status.ok && status.banned => {
                    self.memoize(user_id);
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(user_id, error = %e, "ban status decode failed");
                    false
                }
            },
            Err(e) => {
                warn!(user_id, error = %e, "ban status lookup failed");
                false
            }
        }
    }

    // ---- sync ----

    async fn fetch_list(
        &self,
        url: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Vec<i64>, FetchError> {
        let step = self.cfg.retry_backoff_secs.unwrap_or(DEFAULT_BACKOFF_STEP_SECS);
        let mut last = String::new();
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            match self.http.get(url).send().await {
                Ok(resp) => match resp.text().await {
                    Ok(body) => return Ok(parse_id_list(&body)),
                    Err(e) => last = e.to_string(),
                },
                Err(e) => last = e.to_string(),
            }
            warn!(url, attempt, error = %last, "denylist fetch attempt failed");
            if attempt < MAX_FETCH_ATTEMPTS {
                tokio::select! {
                    _ = shutdown.recv() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(backoff_delay(attempt, step)) => {}
                }
            }
        }
        Err(FetchError::Exhausted {
            attempts: MAX_FETCH_ATTEMPTS,
            last,
        })
    }

    async fn apply_fetched(&self, ids: &[i64]) -> anyhow::Result<()> {
        self.db.denylist().upsert_many(ids).await?;
        self.reload_cache().await
    }

    async fn sync_daily(&self, shutdown: &mut broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut merged: Vec<i64> = Vec::new();
        for url in &self.cfg.daily_urls {
            match self.fetch_list(url, shutdown).await {
                Ok(mut ids) => merged.append(&mut ids),
                Err(FetchError::Cancelled) => return Ok(()),
                Err(e) => warn!(url, error = %e, "daily denylist source failed"),
            }
        }
        if merged.is_empty() {
            return Ok(());
        }
        self.apply_fetched(&merged).await?;
        self.db.kv().set_ts(KEY_LAST_DAILY, now_ts()).await?;
        self.db.kv().set_ts(KEY_LAST_HOURLY, now_ts()).await?;
        info!(ids = merged.len(), "daily denylist refresh applied");
        Ok(())
    }

    async fn sync_hourly(&self, shutdown: &mut broadcast::Receiver<()>) -> anyhow::Result<()> {
        match self.fetch_list(&self.cfg.hourly_url, shutdown).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    self.apply_fetched(&ids).await?;
                }
                self.db.kv().set_ts(KEY_LAST_HOURLY, now_ts()).await?;
                info!(ids = ids.len(), "hourly denylist refresh applied");
            }
            Err(FetchError::Cancelled) => {}
            Err(e) => warn!(error = %e, "hourly denylist refresh failed"),
        }
        Ok(())
    }

    /// Startup: load the snapshot from storage, then run whichever refresh
    /// the persisted timestamps say is due.
    pub async fn bootstrap(&self, shutdown: &mut broadcast::Receiver<()>) -> anyhow::Result<()> {
        self.reload_cache().await?;
        let last_daily = self.db.kv().get_ts(KEY_LAST_DAILY).await?;
        let last_hourly = self.db.kv().get_ts(KEY_LAST_HOURLY).await?;
        match bootstrap_kind(now_ts(), last_daily, last_hourly) {
            SyncKind::Daily => self.sync_daily(shutdown).await?,
            SyncKind::Hourly => self.sync_hourly(shutdown).await?,
            SyncKind::Skip => debug!("denylist fresh enough, skipping bootstrap fetch"),
        }
        Ok(())
    }

    /// Background loop: tick on the refresh interval and re-check staleness
    /// before every network call, so a fetch just done elsewhere is not
    /// repeated.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(
            self.cfg
                .refresh_interval_secs
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; bootstrap covered it
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let last_daily = self.db.kv().get_ts(KEY_LAST_DAILY).await.unwrap_or(0);
                    let last_hourly = self.db.kv().get_ts(KEY_LAST_HOURLY).await.unwrap_or(0);
                    let result = match bootstrap_kind(now_ts(), last_daily, last_hourly) {
                        SyncKind::Daily => self.sync_daily(&mut shutdown).await,
                        SyncKind::Hourly => self.sync_hourly(&mut shutdown).await,
                        SyncKind::Skip => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "denylist refresh iteration failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DenylistConfig {
        DenylistConfig {
            daily_urls: vec!["http://localhost/a".into(), "http://localhost/b".into()],
            hourly_url: "http://localhost/h".into(),
            status_url: None,
            fetch_timeout_secs: Some(1),
            retry_backoff_secs: Some(1),
            refresh_interval_secs: Some(3600),
        }
    }

    #[test]
    fn bootstrap_kind_prefers_staler_cadence() {
        let now = 1_000_000;
        assert_eq!(bootstrap_kind(now, 0, 0), SyncKind::Daily);
        assert_eq!(
            bootstrap_kind(now, now - DAILY_STALE_SECS + 1, now - HOURLY_STALE_SECS),
            SyncKind::Hourly
        );
        assert_eq!(
            bootstrap_kind(now, now - 100, now - 100),
            SyncKind::Skip
        );
    }

    #[test]
    fn backoff_is_linear() {
        assert_eq!(backoff_delay(1, 5), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, 5), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, 5), Duration::from_secs(15));
    }

    #[test]
    fn id_list_parsing_skips_garbage() {
        let body = "123\n456\n\nnot-a-number\n 789 \n";
        assert_eq!(parse_id_list(body), vec![123, 456, 789]);
    }

    #[tokio::test]
    async fn cache_snapshots_do_not_alias() {
        let db = Database::open(":memory:").await.unwrap();
        let svc = DenylistService::new(db, cfg());

        let mut ids: HashSet<i64> = [1, 2, 3].into_iter().collect();
        svc.set_known_banned(&ids);

        ids.insert(4);
        ids.remove(&1);

        assert!(svc.is_known_banned(1));
        assert!(!svc.is_known_banned(4));
    }

    #[tokio::test]
    async fn reload_replaces_the_whole_snapshot() {
        let db = Database::open(":memory:").await.unwrap();
        let svc = DenylistService::new(db.clone(), cfg());

        svc.set_known_banned(&[99].into_iter().collect());
        db.denylist().upsert_many(&[1, 2]).await.unwrap();
        svc.reload_cache().await.unwrap();

        assert!(svc.is_known_banned(1));
        assert!(svc.is_known_banned(2));
        assert!(!svc.is_known_banned(99)); // stale entry gone after full replace
    }

    #[tokio::test]
    async fn check_ban_without_status_endpoint_is_cache_only() {
        let db = Database::open(":memory:").await.unwrap();
        let svc = DenylistService::new(db, cfg());
        svc.set_known_banned(&[7].into_iter().collect());

        assert!(svc.check_ban(7).await);
        assert!(!svc.check_ban(8).await);
    }
}
