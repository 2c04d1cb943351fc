//! Background sweeps: new-member reconciliation and challenge expiry.
//!
//! Both loops tick on their own interval and observe the shared shutdown
//! channel; an iteration is skipped entirely when shutdown was already
//! requested. Expiry is discovered by polling persisted `expires_at`, so a
//! pending challenge is failed eventually even across process restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::challenge::ChallengeController;
use crate::db::{now_ts, Database};
use crate::denylist::DenylistService;
use crate::error::is_gone_participant;
use crate::restrict::RestrictionService;
use crate::transport::{ChatApi, MemberStatus};

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Denylisted accounts are evicted for a year; Telegram treats anything
/// beyond 366 days as forever anyway.
const DENYLIST_BAN_SECS: i64 = 365 * 24 * 3600;

pub struct Gatekeeper {
    api: Arc<dyn ChatApi>,
    db: Database,
    denylist: Arc<DenylistService>,
    restrict: Arc<RestrictionService>,
    challenges: Arc<ChallengeController>,
    debug_chat_id: Option<i64>,
    joiner_interval: Duration,
    expiry_interval: Duration,
}

fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

impl Gatekeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ChatApi>,
        db: Database,
        denylist: Arc<DenylistService>,
        restrict: Arc<RestrictionService>,
        challenges: Arc<ChallengeController>,
        debug_chat_id: Option<i64>,
        joiner_interval_secs: Option<u64>,
        expiry_interval_secs: Option<u64>,
    ) -> Self {
        Self {
            api,
            db,
            denylist,
            restrict,
            challenges,
            debug_chat_id,
            joiner_interval: Duration::from_secs(
                joiner_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            expiry_interval: Duration::from_secs(
                expiry_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
        }
    }

    pub async fn run_joiner_sweep(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.joiner_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if shutdown_requested(&mut shutdown) {
                        break;
                    }
                    if let Err(e) = self.sweep_joiners_once().await {
                        warn!(error = %e, "joiner sweep iteration failed");
                    }
                }
            }
        }
        info!("joiner sweep stopped");
    }

    pub async fn run_expiry_sweep(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.expiry_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if shutdown_requested(&mut shutdown) {
                        break;
                    }
                    if let Err(e) = self.sweep_expired_once().await {
                        warn!(error = %e, "expiry sweep iteration failed");
                    }
                }
            }
        }
        info!("expiry sweep stopped");
    }

    /// Reconcile every unprocessed joiner against live membership and the
    /// denylist.
    pub async fn sweep_joiners_once(&self) -> Result<()> {
        let pending = self.db.joiners().unprocessed().await?;
        for joiner in pending {
            match self.api.member_status(joiner.chat_id, joiner.user_id).await {
                Ok(MemberStatus::Left) | Ok(MemberStatus::Banned) => {
                    // gone before we got to them
                    self.db.joiners().mark_processed(joiner.id, false).await?;
                    continue;
                }
                Ok(MemberStatus::Present) => {}
                Err(e) => {
                    let text = e.to_string();
                    if is_gone_participant(&text) {
                        self.db.joiners().mark_processed(joiner.id, false).await?;
                    } else {
                        // transient; retry on the next tick
                        warn!(user_id = joiner.user_id, chat_id = joiner.chat_id,
                              error = %text, "membership lookup failed");
                    }
                    continue;
                }
            }

            if self.denylist.check_ban(joiner.user_id).await {
                info!(user_id = joiner.user_id, chat_id = joiner.chat_id,
                      "joiner found on denylist, banning");
                if let Err(e) = self
                    .restrict
                    .ban(joiner.chat_id, joiner.user_id, DENYLIST_BAN_SECS, "denylisted account")
                    .await
                {
                    warn!(user_id = joiner.user_id, error = %e, "denylist ban failed");
                }
                if let Some(join_msg_id) = joiner.join_msg_id {
                    let _ = self.api.delete_message(joiner.chat_id, join_msg_id).await;
                }
                if let Some(debug_chat) = self.debug_chat_id {
                    let note = format!(
                        "denylist hit: {} ({}) removed from chat {}",
                        joiner.display_name, joiner.user_id, joiner.chat_id
                    );
                    let _ = self.api.send_message(debug_chat, &note).await;
                }
                self.db.joiners().mark_processed(joiner.id, true).await?;
            } else {
                self.db.joiners().mark_processed(joiner.id, false).await?;
            }
        }
        Ok(())
    }

    /// Fail every challenge whose deadline has passed.
    pub async fn sweep_expired_once(&self) -> Result<()> {
        let expired = self.db.challenges().expired(now_ts()).await?;
        if !expired.is_empty() {
            debug!(count = expired.len(), "failing expired challenges");
        }
        for challenge in expired {
            if let Err(e) = self.challenges.fail_expired(&challenge).await {
                warn!(user_id = challenge.user_id, error = %e, "expiry resolution failed");
            }
        }
        Ok(())
    }
}
