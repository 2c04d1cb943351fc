//! Community-vote consensus over disputed spam accusations.
//!
//! One pending case per (chat, user). Suspect messages are deleted and the
//! author muted while the chat votes; known-bad senders skip the vote and
//! are banned outright. Votes are upserts, quorum is recomputed from current
//! settings on every vote, and a scheduled resolution at the voting timeout
//! backstops chats that never reach quorum.
//!
//! Resolution policy: a case resolves `spam` only when "spam" votes strictly
//! outnumber "not spam" votes AND the quorum was reached. Ties and
//! insufficient votes at timeout resolve `false_positive` — the engine never
//! punishes on ambiguity.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::ChatCache;
use crate::config::Defaults;
use crate::db::{now_ts, CaseStatus, ChatSettings, Database, VoteTally};
use crate::i18n::{format_template, Lexicon};
use crate::restrict::RestrictionService;
use crate::transport::ChatApi;

/// Ban length for community-confirmed or denylisted spammers.
const SPAM_BAN_SECS: i64 = 365 * 24 * 3600;

/// How long a vote prompt outlives its voting window before deletion.
const PROMPT_LINGER_SECS: i64 = 600;

/// `max(min_voters, member_count * percent / 100)`, capped by `max_voters`
/// when the cap is positive, floored at 1.
pub fn required_voters(member_count: i64, min_voters: i64, max_voters: i64, min_percent: i64) -> i64 {
    let mut required = std::cmp::max(min_voters, member_count * min_percent / 100);
    if max_voters > 0 {
        required = required.min(max_voters);
    }
    required.max(1)
}

/// The single source of truth for turning a tally into a verdict.
pub fn verdict(tally: VoteTally, required: i64) -> CaseStatus {
    if tally.no > tally.yes && tally.total() >= required {
        CaseStatus::Spam
    } else {
        CaseStatus::FalsePositive
    }
}

/// `"v;<case_id>;<1|0>"` — 1 votes "not spam".
pub fn vote_payload(case_id: i64, not_spam: bool) -> String {
    format!("v;{};{}", case_id, if not_spam { 1 } else { 0 })
}

pub fn parse_vote_payload(data: &str) -> Option<(i64, bool)> {
    let mut parts = data.splitn(3, ';');
    if parts.next()? != "v" {
        return None;
    }
    let case_id = parts.next()?.parse::<i64>().ok()?;
    let vote = match parts.next()? {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    Some((case_id, vote))
}

/// Deep link to a message in a supergroup/channel (`-100…` ids).
fn message_link(chat_id: i64, message_id: i64) -> String {
    let internal = chat_id
        .to_string()
        .strip_prefix("-100")
        .map(str::to_string)
        .unwrap_or_else(|| chat_id.unsigned_abs().to_string());
    format!("https://t.me/c/{internal}/{message_id}")
}

#[derive(Clone)]
pub struct SpamConsensus {
    api: Arc<dyn ChatApi>,
    db: Database,
    restrict: Arc<RestrictionService>,
    lexicon: Arc<Lexicon>,
    cache: Arc<ChatCache>,
    defaults: Defaults,
    debug_chat_id: Option<i64>,
    shutdown: broadcast::Sender<()>,
}

impl SpamConsensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ChatApi>,
        db: Database,
        restrict: Arc<RestrictionService>,
        lexicon: Arc<Lexicon>,
        cache: Arc<ChatCache>,
        defaults: Defaults,
        debug_chat_id: Option<i64>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            api,
            db,
            restrict,
            lexicon,
            cache,
            defaults,
            debug_chat_id,
            shutdown,
        }
    }

    /// A classifier hit in a voting-enabled chat: open (or reuse) the case,
    /// scrub the message, mute the author pending consensus, and post the
    /// vote prompt.
    pub async fn handle_suspect(
        &self,
        chat_id: i64,
        user_id: i64,
        message_id: i64,
        text: &str,
        display_name: &str,
        lang: &str,
    ) -> Result<()> {
        let settings = self.db.settings().get(chat_id).await?;
        let case = self
            .db
            .spam_cases()
            .get_or_create(chat_id, user_id, text, now_ts())
            .await?;

        let _ = self.api.delete_message(chat_id, message_id).await;

        let voting_timeout = settings.voting_timeout(&self.defaults);
        if let Err(e) = self
            .restrict
            .mute(chat_id, user_id, voting_timeout, "spam vote pending")
            .await
        {
            if e.is_no_privileges() {
                self.notify_no_privileges(chat_id, lang).await;
            } else {
                warn!(user_id, chat_id, error = %e, "suspect mute failed");
            }
        }

        let prompt = format_template(
            &self.lexicon.get("vote.prompt", lang),
            &[("user", display_name), ("text", text)],
        );
        let buttons = vec![vec![
            (self.lexicon.get("vote.yes", lang), vote_payload(case.id, true)),
            (self.lexicon.get("vote.no", lang), vote_payload(case.id, false)),
        ]];

        match settings.log_channel_id {
            Some(channel_id) => {
                // prompt goes to the log channel, the chat gets a link back
                if let Ok(msg_id) = self.api.send_keyboard(channel_id, &prompt, buttons).await {
                    self.db.spam_cases().set_channel_msg(case.id, msg_id).await?;
                    self.schedule_deletion(channel_id, msg_id, voting_timeout + PROMPT_LINGER_SECS);
                    let note = format_template(
                        &self.lexicon.get("vote.link", lang),
                        &[("user", display_name), ("link", &message_link(channel_id, msg_id))],
                    );
                    if let Ok(note_id) = self.api.send_message(chat_id, &note).await {
                        self.db.spam_cases().set_notif_msg(case.id, note_id).await?;
                        self.schedule_deletion(chat_id, note_id, voting_timeout + PROMPT_LINGER_SECS);
                    }
                }
            }
            None => {
                if let Ok(msg_id) = self.api.send_keyboard(chat_id, &prompt, buttons).await {
                    self.db.spam_cases().set_notif_msg(case.id, msg_id).await?;
                    self.schedule_deletion(chat_id, msg_id, voting_timeout + PROMPT_LINGER_SECS);
                }
            }
        }

        self.schedule_resolution(case.id, voting_timeout);
        debug!(case_id = case.id, chat_id, user_id, "spam case opened");
        Ok(())
    }

    /// The sender is already known-bad: no vote, immediate ban, and the
    /// case is recorded as resolved spam.
    pub async fn handle_banned_sender(
        &self,
        chat_id: i64,
        user_id: i64,
        message_id: i64,
        text: &str,
        display_name: &str,
        lang: &str,
    ) -> Result<()> {
        let case = self
            .db
            .spam_cases()
            .get_or_create(chat_id, user_id, text, now_ts())
            .await?;

        let _ = self.api.delete_message(chat_id, message_id).await;

        if let Err(e) = self
            .restrict
            .ban(chat_id, user_id, SPAM_BAN_SECS, "denylisted sender")
            .await
        {
            if e.is_no_privileges() {
                self.notify_no_privileges(chat_id, lang).await;
            } else {
                warn!(user_id, chat_id, error = %e, "banned-sender ban failed");
            }
        }

        let note = format_template(
            &self.lexicon.get("spam.banned", lang),
            &[("user", display_name)],
        );
        if let Ok(note_id) = self.api.send_message(chat_id, &note).await {
            self.db.spam_cases().set_notif_msg(case.id, note_id).await?;
            self.schedule_deletion(chat_id, note_id, PROMPT_LINGER_SECS);
        }

        self.db
            .spam_cases()
            .resolve(case.id, CaseStatus::Spam, now_ts())
            .await?;
        info!(case_id = case.id, chat_id, user_id, "banned sender handled");
        Ok(())
    }

    /// Record (or replace) a vote, then resolve early once quorum is met.
    pub async fn on_vote(
        &self,
        case_id: i64,
        voter_id: i64,
        not_spam: bool,
        callback_id: &str,
        lang: &str,
    ) -> Result<()> {
        let Some(case) = self.db.spam_cases().get(case_id).await? else {
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("vote.closed", lang))
                .await;
            return Ok(());
        };
        if case.status != CaseStatus::Pending {
            let _ = self
                .api
                .answer_callback(callback_id, &self.lexicon.get("vote.closed", lang))
                .await;
            return Ok(());
        }

        self.db
            .spam_votes()
            .upsert(case_id, voter_id, not_spam, now_ts())
            .await?;
        let _ = self
            .api
            .answer_callback(callback_id, &self.lexicon.get("vote.counted", lang))
            .await;

        let required = self.required_for(case.chat_id).await?;
        let tally = self.db.spam_votes().tally(case_id).await?;
        if tally.total() >= required {
            self.resolve_case(case_id).await?;
        }
        Ok(())
    }

    async fn required_for(&self, chat_id: i64) -> Result<i64> {
        let settings = self.db.settings().get(chat_id).await?;
        let member_count = self.cache.get(self.api.as_ref(), chat_id).await.member_count;
        Ok(required_voters(
            member_count,
            settings.min_voters(&self.defaults),
            settings.max_voters(&self.defaults),
            settings.min_voters_percent(&self.defaults),
        ))
    }

    /// Terminal transition. Safe to call from both the vote path and the
    /// timeout task: whoever loses the race finds a non-pending case and
    /// does nothing.
    pub async fn resolve_case(&self, case_id: i64) -> Result<()> {
        let Some(case) = self.db.spam_cases().get(case_id).await? else {
            return Ok(());
        };
        if case.status != CaseStatus::Pending {
            return Ok(());
        }

        let required = self.required_for(case.chat_id).await?;
        let tally = self.db.spam_votes().tally(case_id).await?;
        let outcome = verdict(tally, required);

        if !self
            .db
            .spam_cases()
            .resolve(case_id, outcome, now_ts())
            .await?
        {
            return Ok(()); // lost the race
        }

        match outcome {
            CaseStatus::Spam => {
                if let Err(e) = self
                    .restrict
                    .ban(case.chat_id, case.user_id, SPAM_BAN_SECS, "community vote")
                    .await
                {
                    warn!(case_id, error = %e, "spam-verdict ban failed");
                }
                // membership changed, drop the cached count
                self.cache.invalidate(case.chat_id);
            }
            CaseStatus::FalsePositive => {
                if let Err(e) = self.restrict.unmute(case.chat_id, case.user_id).await {
                    warn!(case_id, error = %e, "false-positive unmute failed");
                }
            }
            CaseStatus::Pending => unreachable!("verdict never returns pending"),
        }

        let settings = self.db.settings().get(case.chat_id).await?;
        if let (Some(channel_id), Some(msg_id)) = (settings.log_channel_id, case.channel_msg_id) {
            let _ = self.api.delete_message(channel_id, msg_id).await;
        }
        if let Some(msg_id) = case.notif_msg_id {
            let _ = self.api.delete_message(case.chat_id, msg_id).await;
        }

        info!(case_id, outcome = outcome.as_str(), yes = tally.yes, no = tally.no,
              "spam case resolved");
        Ok(())
    }

    async fn notify_no_privileges(&self, chat_id: i64, lang: &str) {
        warn!(chat_id, "missing restrict privileges");
        if let Some(debug_chat) = self.debug_chat_id {
            let text = format_template(
                &self.lexicon.get("admin.no_rights", lang),
                &[("chat", chat_id.to_string().as_str())],
            );
            let _ = self.api.send_message(debug_chat, &text).await;
        }
    }

    fn schedule_deletion(&self, chat_id: i64, message_id: i64, delay_secs: i64) {
        let api = Arc::clone(&self.api);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => {}
                _ = tokio::time::sleep(Duration::from_secs(delay_secs.max(0) as u64)) => {
                    let _ = api.delete_message(chat_id, message_id).await;
                }
            }
        });
    }

    fn schedule_resolution(&self, case_id: i64, delay_secs: i64) {
        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => {}
                _ = tokio::time::sleep(Duration::from_secs(delay_secs.max(0) as u64)) => {
                    if let Err(e) = engine.resolve_case(case_id).await {
                        warn!(case_id, error = %e, "scheduled resolution failed");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockApi;

    fn defaults() -> Defaults {
        Defaults {
            challenge_timeout_secs: 180,
            reject_timeout_secs: 600,
            voting_timeout_secs: 300,
            min_voters: 2,
            max_voters: 10,
            min_voters_percent: 5,
            captcha_options: 6,
        }
    }

    #[test]
    fn quorum_formula() {
        // members=0, min=2 -> 2
        assert_eq!(required_voters(0, 2, 0, 5), 2);
        // percentage dominates once the chat is big enough
        assert_eq!(required_voters(200, 2, 0, 5), 10);
        // positive cap applies
        assert_eq!(required_voters(1000, 2, 10, 5), 10);
        // cap of zero means "no cap", not "zero voters"
        assert_eq!(required_voters(1000, 2, 0, 5), 50);
        // floored at 1
        assert_eq!(required_voters(0, 0, 0, 0), 1);
    }

    #[test]
    fn quorum_is_monotone_in_min_voters() {
        let mut prev = 0;
        for min in 1..20 {
            let r = required_voters(100, min, 0, 5);
            assert!(r >= prev);
            prev = r;
        }
        // applying a positive cap never increases the requirement
        for members in [0, 50, 500, 5000] {
            let uncapped = required_voters(members, 3, 0, 10);
            let capped = required_voters(members, 3, 7, 10);
            assert!(capped <= uncapped);
        }
    }

    #[test]
    fn verdict_policy_is_lenient() {
        // majority "spam" at quorum -> spam
        assert_eq!(verdict(VoteTally { yes: 1, no: 3 }, 3), CaseStatus::Spam);
        // tie -> false positive
        assert_eq!(verdict(VoteTally { yes: 2, no: 2 }, 3), CaseStatus::FalsePositive);
        // majority "spam" but below quorum -> false positive
        assert_eq!(verdict(VoteTally { yes: 0, no: 1 }, 3), CaseStatus::FalsePositive);
        // majority "not spam" -> false positive
        assert_eq!(verdict(VoteTally { yes: 3, no: 1 }, 3), CaseStatus::FalsePositive);
    }

    #[test]
    fn vote_payload_roundtrip() {
        assert_eq!(parse_vote_payload(&vote_payload(42, true)), Some((42, true)));
        assert_eq!(parse_vote_payload(&vote_payload(42, false)), Some((42, false)));
        assert_eq!(parse_vote_payload("v;42;2"), None);
        assert_eq!(parse_vote_payload("42;token"), None);
        assert_eq!(parse_vote_payload("v;notanumber;1"), None);
    }

    #[test]
    fn supergroup_message_links() {
        assert_eq!(message_link(-1001234567, 55), "https://t.me/c/1234567/55");
    }

    async fn engine() -> (Arc<MockApi>, Database, SpamConsensus) {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        let restrict = Arc::new(RestrictionService::new(api.clone(), db.clone()));
        let (tx, _) = broadcast::channel(4);
        let engine = SpamConsensus::new(
            api.clone(),
            db.clone(),
            restrict,
            Arc::new(Lexicon::builtin()),
            Arc::new(ChatCache::new()),
            defaults(),
            Some(-999),
            tx,
        );
        (api, db, engine)
    }

    #[tokio::test]
    async fn suspect_is_muted_and_prompt_posted() {
        let (api, db, engine) = engine().await;
        engine
            .handle_suspect(-50, 8, 123, "buy crypto now", "mallory", "en")
            .await
            .unwrap();

        assert!(api.has_call("delete_message chat=-50 msg=123"));
        assert!(api.has_call("mute chat=-50 user=8"));
        assert!(api.has_call("send_keyboard chat=-50") && api.has_call("buttons=2"));
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();
        assert!(case.notif_msg_id.is_some());
    }

    #[tokio::test]
    async fn mute_privilege_failure_pings_debug_chat() {
        let (api, _db, engine) = engine().await;
        api.privilege_failures.lock().unwrap().push("mute_member");
        engine
            .handle_suspect(-50, 8, 123, "spam", "mallory", "en")
            .await
            .unwrap();
        assert!(api.has_call("send_message chat=-999"));
    }

    #[tokio::test]
    async fn three_spam_votes_reach_quorum_and_ban() {
        let (api, db, engine) = engine().await;
        // required = max(min_voters=2, 0) but we want 3, so raise min_voters
        db.settings()
            .upsert(&ChatSettings {
                chat_id: -50,
                voting_enabled: true,
                min_voters: Some(3),
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        engine
            .handle_suspect(-50, 8, 123, "spam text", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();

        engine.on_vote(case.id, 201, false, "cb1", "en").await.unwrap();
        engine.on_vote(case.id, 202, false, "cb2", "en").await.unwrap();
        // two of three: still pending
        assert_eq!(
            db.spam_cases().get(case.id).await.unwrap().unwrap().status,
            CaseStatus::Pending
        );

        engine.on_vote(case.id, 203, false, "cb3", "en").await.unwrap();
        assert_eq!(
            db.spam_cases().get(case.id).await.unwrap().unwrap().status,
            CaseStatus::Spam
        );
        assert!(api.has_call("ban chat=-50 user=8"));
    }

    #[tokio::test]
    async fn tie_at_timeout_resolves_false_positive_and_unmutes() {
        let (api, db, engine) = engine().await;
        engine
            .handle_suspect(-50, 8, 123, "maybe spam", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();

        db.spam_votes().upsert(case.id, 201, false, 1).await.unwrap();
        db.spam_votes().upsert(case.id, 202, true, 2).await.unwrap();

        engine.resolve_case(case.id).await.unwrap();
        assert_eq!(
            db.spam_cases().get(case.id).await.unwrap().unwrap().status,
            CaseStatus::FalsePositive
        );
        assert!(api.has_call("unmute chat=-50 user=8"));
        assert!(!api.has_call("ban chat=-50"));
    }

    #[tokio::test]
    async fn insufficient_votes_at_timeout_do_not_ban() {
        let (api, db, engine) = engine().await;
        engine
            .handle_suspect(-50, 8, 123, "spam?", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();
        db.spam_votes().upsert(case.id, 201, false, 1).await.unwrap(); // 1 of 2 required

        engine.resolve_case(case.id).await.unwrap();
        assert_eq!(
            db.spam_cases().get(case.id).await.unwrap().unwrap().status,
            CaseStatus::FalsePositive
        );
        assert!(!api.has_call("ban chat=-50"));
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let (_api, db, engine) = engine().await;
        engine
            .handle_suspect(-50, 8, 123, "spam", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();
        engine.resolve_case(case.id).await.unwrap();
        engine.resolve_case(case.id).await.unwrap(); // second call no-ops
        engine.resolve_case(987654).await.unwrap(); // missing case no-ops
    }

    #[tokio::test]
    async fn vote_on_closed_case_is_rejected() {
        let (api, db, engine) = engine().await;
        engine
            .handle_suspect(-50, 8, 123, "spam", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();
        engine.resolve_case(case.id).await.unwrap();

        engine.on_vote(case.id, 300, false, "cb9", "en").await.unwrap();
        assert!(api.has_call("answer_callback id=cb9"));
        let tally = db.spam_votes().tally(case.id).await.unwrap();
        assert_eq!(tally.total(), 0);
    }

    #[tokio::test]
    async fn spam_resolution_drops_the_cached_member_count() {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        let restrict = Arc::new(RestrictionService::new(api.clone(), db.clone()));
        let cache = Arc::new(ChatCache::new());
        let (tx, _) = broadcast::channel(4);
        let engine = SpamConsensus::new(
            api.clone(),
            db.clone(),
            restrict,
            Arc::new(Lexicon::builtin()),
            cache.clone(),
            defaults(),
            None,
            tx,
        );

        api.member_counts.lock().unwrap().insert(-50, 40);
        engine
            .handle_suspect(-50, 8, 123, "spam", "mallory", "en")
            .await
            .unwrap();
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();

        db.spam_votes().upsert(case.id, 201, false, 1).await.unwrap();
        db.spam_votes().upsert(case.id, 202, false, 2).await.unwrap();
        // quorum is min_voters=2 (40 * 5% = 2)
        engine.resolve_case(case.id).await.unwrap();

        api.member_counts.lock().unwrap().insert(-50, 39);
        assert_eq!(cache.get(api.as_ref(), -50).await.member_count, 39);
    }

    #[tokio::test]
    async fn banned_sender_is_removed_without_a_vote() {
        let (api, db, engine) = engine().await;
        engine
            .handle_banned_sender(-50, 8, 123, "spam blast", "mallory", "en")
            .await
            .unwrap();

        assert!(api.has_call("delete_message chat=-50 msg=123"));
        assert!(api.has_call("ban chat=-50 user=8"));
        // notification carries no vote buttons
        assert!(!api.has_call("send_keyboard"));
        assert!(api.has_call("send_message chat=-50"));
        assert!(db.spam_cases().pending_for(-50, 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_channel_receives_the_prompt() {
        let (api, db, engine) = engine().await;
        db.settings()
            .upsert(&ChatSettings {
                chat_id: -50,
                voting_enabled: true,
                log_channel_id: Some(-1009),
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        engine
            .handle_suspect(-50, 8, 123, "spam", "mallory", "en")
            .await
            .unwrap();

        assert!(api.has_call("send_keyboard chat=-1009"));
        assert!(api.has_call("send_message chat=-50")); // link back
        let case = db.spam_cases().pending_for(-50, 8).await.unwrap().unwrap();
        assert!(case.channel_msg_id.is_some());
        assert!(case.notif_msg_id.is_some());
    }
}
