//! Join-challenge lifecycle: Pending -> Succeeded | Failed.
//!
//! A challenge is created when a user joins (or asks to join) a gated chat,
//! resolved by that user's captcha callback, and failed by the expiry sweep
//! when nobody ever clicks. All state lives in storage; nothing here depends
//! on an in-memory timer surviving a restart.
//!
//! Settings are read fresh on every join and every resolution, so live
//! config changes apply to in-flight challenges.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::ChatCache;
use crate::captcha::{build_captcha, random_token};
use crate::config::Defaults;
use crate::db::{now_ts, Challenge, ChatSettings, Database};
use crate::i18n::{format_template, Lexicon};
use crate::restrict::RestrictionService;
use crate::transport::{ChatApi, KeyboardRows};

pub const MAX_ATTEMPTS: i64 = 3;

/// What a callback did, surfaced for the dispatcher's logging and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Someone other than the challenged user clicked.
    NotYours,
    /// No live challenge for this (chat, user) — resolved elsewhere already.
    NoChallenge,
    Succeeded,
    Failed,
}

pub struct ChallengeController {
    api: Arc<dyn ChatApi>,
    db: Database,
    restrict: Arc<RestrictionService>,
    lexicon: Arc<Lexicon>,
    cache: Arc<ChatCache>,
    defaults: Defaults,
    shutdown: broadcast::Sender<()>,
}

impl ChallengeController {
    pub fn new(
        api: Arc<dyn ChatApi>,
        db: Database,
        restrict: Arc<RestrictionService>,
        lexicon: Arc<Lexicon>,
        cache: Arc<ChatCache>,
        defaults: Defaults,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            api,
            db,
            restrict,
            lexicon,
            cache,
            defaults,
            shutdown,
        }
    }

    /// Direct join into a public group: record the joiner for the sweep,
    /// then (if gatekeeping is on) restrict them and post the captcha in the
    /// chat itself.
    pub async fn on_join(
        &self,
        chat_id: i64,
        user_id: i64,
        display_name: &str,
        join_msg_id: Option<i64>,
        lang: &str,
    ) -> Result<()> {
        if let Err(e) = self
            .db
            .joiners()
            .insert(user_id, chat_id, now_ts(), join_msg_id, display_name)
            .await
        {
            warn!(user_id, chat_id, error = %e, "failed to record joiner");
        }

        let settings = self.db.settings().get(chat_id).await?;
        if !settings.gatekeeper_enabled {
            return Ok(());
        }
        self.start_challenge(chat_id, chat_id, user_id, display_name, join_msg_id, &settings, lang)
            .await
    }

    /// Join request into a gated chat: the captcha runs in the user's
    /// private chat and the user is not yet a member, so no restriction is
    /// placed.
    pub async fn on_join_request(
        &self,
        target_chat_id: i64,
        user_chat_id: i64,
        user_id: i64,
        display_name: &str,
        lang: &str,
    ) -> Result<()> {
        let settings = self.db.settings().get(target_chat_id).await?;
        if !settings.gatekeeper_enabled {
            if let Err(e) = self.api.approve_join_request(target_chat_id, user_id).await {
                warn!(user_id, target_chat_id, error = %e, "auto-approve failed");
            }
            return Ok(());
        }
        self.start_challenge(
            user_chat_id,
            target_chat_id,
            user_id,
            display_name,
            None,
            &settings,
            lang,
        )
        .await
    }

    async fn start_challenge(
        &self,
        comm_chat_id: i64,
        target_chat_id: i64,
        user_id: i64,
        display_name: &str,
        join_msg_id: Option<i64>,
        settings: &ChatSettings,
        lang: &str,
    ) -> Result<()> {
        let timeout = settings.challenge_timeout(&self.defaults);
        let direct_join = comm_chat_id == target_chat_id;

        if direct_join {
            if let Err(e) = self
                .restrict
                .mute(target_chat_id, user_id, timeout, "join challenge")
                .await
            {
                warn!(user_id, target_chat_id, error = %e, "could not restrict joiner");
            }
        }

        let token = random_token();
        let now = now_ts();
        let challenge = Challenge {
            comm_chat_id,
            user_id,
            target_chat_id,
            success_token: token.clone(),
            join_msg_id,
            challenge_msg_id: None,
            attempts: 0,
            created_at: now,
            expires_at: now + timeout,
        };
        self.db.challenges().upsert(&challenge).await?;

        let captcha = build_captcha(lang, user_id, &token, self.defaults.captcha_options);
        let prompt = format_template(
            &self.lexicon.get("captcha.prompt", lang),
            &[
                ("user", display_name),
                ("answer", &captcha.answer_name),
                ("timeout", &timeout.to_string()),
            ],
        );
        let rows: KeyboardRows = captcha
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|b| (b.label, b.payload)).collect())
            .collect();

        match self.api.send_keyboard(comm_chat_id, &prompt, rows).await {
            Ok(msg_id) => {
                self.db
                    .challenges()
                    .set_message_id(comm_chat_id, user_id, msg_id)
                    .await?;
            }
            // The expiry sweep will fail the challenge even if the captcha
            // message never went out.
            Err(e) => warn!(user_id, comm_chat_id, error = %e, "captcha send failed"),
        }
        Ok(())
    }

    /// Resolve a captcha button press. Only the challenged user counts;
    /// everyone else gets a notice and no state changes.
    pub async fn on_callback(
        &self,
        comm_chat_id: i64,
        from_user: i64,
        payload_user: i64,
        token: &str,
        callback_id: &str,
        lang: &str,
    ) -> Result<CallbackOutcome> {
        if from_user != payload_user {
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("captcha.not_yours", lang))
                .await;
            return Ok(CallbackOutcome::NotYours);
        }

        let Some(challenge) = self.db.challenges().get(comm_chat_id, payload_user).await? else {
            // Raced with the expiry sweep or a duplicate click. No-op.
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("captcha.expired", lang))
                .await;
            return Ok(CallbackOutcome::NoChallenge);
        };

        let settings = self.db.settings().get(challenge.target_chat_id).await?;
        let now = now_ts();

        if now > challenge.expires_at || challenge.attempts >= MAX_ATTEMPTS {
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("captcha.expired", lang))
                .await;
            self.fail(&challenge, &settings, lang).await?;
            return Ok(CallbackOutcome::Failed);
        }

        self.db
            .challenges()
            .set_attempts(comm_chat_id, payload_user, challenge.attempts + 1)
            .await?;

        if token == challenge.success_token {
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("captcha.passed", lang))
                .await;
            self.succeed(&challenge, lang).await?;
            Ok(CallbackOutcome::Succeeded)
        } else {
            // Tokens are single-use per message: a wrong one fails now.
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("captcha.failed", lang))
                .await;
            self.fail(&challenge, &settings, lang).await?;
            Ok(CallbackOutcome::Failed)
        }
    }

    async fn succeed(&self, challenge: &Challenge, lang: &str) -> Result<()> {
        if let Some(msg_id) = challenge.challenge_msg_id {
            let _ = self.api.delete_message(challenge.comm_chat_id, msg_id).await;
        }

        if challenge.is_join_request() {
            if let Err(e) = self
                .api
                .approve_join_request(challenge.target_chat_id, challenge.user_id)
                .await
            {
                warn!(user_id = challenge.user_id, error = %e, "approve failed");
            }
            let title = self
                .cache
                .get(self.api.as_ref(), challenge.target_chat_id)
                .await
                .title;
            let text = format_template(
                &self.lexicon.get("join.approved", lang),
                &[("chat", title.as_str())],
            );
            let _ = self.api.send_message(challenge.comm_chat_id, &text).await;
        } else if let Err(e) = self
            .restrict
            .unmute(challenge.target_chat_id, challenge.user_id)
            .await
        {
            warn!(user_id = challenge.user_id, error = %e, "unmute failed");
        }

        self.db
            .challenges()
            .delete(challenge.comm_chat_id, challenge.user_id)
            .await?;
        debug!(user_id = challenge.user_id, chat_id = challenge.target_chat_id, "challenge passed");
        Ok(())
    }

    /// Shared Failed path, also used by the expiry sweep.
    pub async fn fail(
        &self,
        challenge: &Challenge,
        settings: &ChatSettings,
        lang: &str,
    ) -> Result<()> {
        let reject_timeout = settings.reject_timeout(&self.defaults);

        if let Some(msg_id) = challenge.challenge_msg_id {
            let _ = self.api.delete_message(challenge.comm_chat_id, msg_id).await;
        }
        if let Some(join_msg_id) = challenge.join_msg_id {
            let _ = self
                .api
                .delete_message(challenge.target_chat_id, join_msg_id)
                .await;
        }

        if let Err(e) = self
            .restrict
            .ban(
                challenge.target_chat_id,
                challenge.user_id,
                reject_timeout,
                "failed join challenge",
            )
            .await
        {
            warn!(user_id = challenge.user_id, error = %e, "reject ban failed");
        }
        self.cache.invalidate(challenge.target_chat_id);

        if challenge.is_join_request() {
            if let Err(e) = self
                .api
                .decline_join_request(challenge.target_chat_id, challenge.user_id)
                .await
            {
                warn!(user_id = challenge.user_id, error = %e, "decline failed");
            }
            let title = self
                .cache
                .get(self.api.as_ref(), challenge.target_chat_id)
                .await
                .title;
            let text = format_template(
                &self.lexicon.get("join.declined", lang),
                &[("chat", title.as_str())],
            );
            if let Ok(notice_id) = self.api.send_message(challenge.comm_chat_id, &text).await {
                self.schedule_deletion(challenge.comm_chat_id, notice_id, reject_timeout);
            }
        }

        self.db
            .challenges()
            .delete(challenge.comm_chat_id, challenge.user_id)
            .await?;
        debug!(user_id = challenge.user_id, chat_id = challenge.target_chat_id, "challenge failed");
        Ok(())
    }

    /// Expiry-sweep entry point: fresh settings, best-effort title, then the
    /// normal Failed path.
    pub async fn fail_expired(&self, challenge: &Challenge) -> Result<()> {
        let settings = self.db.settings().get(challenge.target_chat_id).await?;
        self.fail(challenge, &settings, "en").await
    }

    fn schedule_deletion(&self, chat_id: i64, message_id: i64, delay_secs: i64) {
        let api = Arc::clone(&self.api);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs.max(0) as u64)) => {
                    let _ = api.delete_message(chat_id, message_id).await;
                }
            }
        });
    }
}
