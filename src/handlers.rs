//! Ordered event-handler chain.
//!
//! Every inbound update becomes one `Event` and walks the chain in order;
//! each handler either consumes it (`Flow::Stop`) or passes it on. Malformed
//! callback payloads fall through every handler and end up unhandled, which
//! is deliberate.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::captcha;
use crate::challenge::ChallengeController;
use crate::classify::SpamClassifier;
use crate::consensus::{self, SpamConsensus};
use crate::db::Database;
use crate::denylist::DenylistService;

#[derive(Debug, Clone)]
pub enum Event {
    NewMember {
        chat_id: i64,
        user_id: i64,
        display_name: String,
        join_msg_id: Option<i64>,
        lang: String,
    },
    JoinRequest {
        target_chat_id: i64,
        user_chat_id: i64,
        user_id: i64,
        display_name: String,
        lang: String,
    },
    Callback {
        callback_id: String,
        chat_id: i64,
        from_user: i64,
        payload: String,
        lang: String,
    },
    Message {
        chat_id: i64,
        user_id: i64,
        message_id: i64,
        text: String,
        display_name: String,
        lang: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<Flow>;
}

pub struct HandlerChain {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }

    /// Run the event through the chain. A handler error is logged and the
    /// event moves on; one bad event never takes the dispatcher down.
    pub async fn dispatch(&self, event: &Event) {
        for handler in &self.handlers {
            match handler.handle(event).await {
                Ok(Flow::Stop) => return,
                Ok(Flow::Continue) => {}
                Err(e) => warn!(error = %e, "handler failed, continuing chain"),
            }
        }
        debug!(?event, "event unhandled");
    }
}

// ---- concrete handlers, in dispatch order ----

/// Spam-vote button presses (`"v;<case>;<vote>"` payloads).
pub struct VoteCallbackHandler {
    pub consensus: Arc<SpamConsensus>,
}

#[async_trait]
impl EventHandler for VoteCallbackHandler {
    async fn handle(&self, event: &Event) -> Result<Flow> {
        let Event::Callback { callback_id, from_user, payload, lang, .. } = event else {
            return Ok(Flow::Continue);
        };
        let Some((case_id, not_spam)) = consensus::parse_vote_payload(payload) else {
            return Ok(Flow::Continue);
        };
        self.consensus
            .on_vote(case_id, *from_user, not_spam, callback_id, lang)
            .await?;
        Ok(Flow::Stop)
    }
}

/// Captcha button presses (`"<user>;<token>"` payloads).
pub struct ChallengeCallbackHandler {
    pub challenges: Arc<ChallengeController>,
}

#[async_trait]
impl EventHandler for ChallengeCallbackHandler {
    async fn handle(&self, event: &Event) -> Result<Flow> {
        let Event::Callback { callback_id, chat_id, from_user, payload, lang } = event else {
            return Ok(Flow::Continue);
        };
        let Some((payload_user, token)) = captcha::parse_payload(payload) else {
            return Ok(Flow::Continue);
        };
        self.challenges
            .on_callback(*chat_id, *from_user, payload_user, token, callback_id, lang)
            .await?;
        Ok(Flow::Stop)
    }
}

pub struct JoinHandler {
    pub challenges: Arc<ChallengeController>,
}

#[async_trait]
impl EventHandler for JoinHandler {
    async fn handle(&self, event: &Event) -> Result<Flow> {
        let Event::NewMember { chat_id, user_id, display_name, join_msg_id, lang } = event else {
            return Ok(Flow::Continue);
        };
        self.challenges
            .on_join(*chat_id, *user_id, display_name, *join_msg_id, lang)
            .await?;
        Ok(Flow::Stop)
    }
}

pub struct JoinRequestHandler {
    pub challenges: Arc<ChallengeController>,
}

#[async_trait]
impl EventHandler for JoinRequestHandler {
    async fn handle(&self, event: &Event) -> Result<Flow> {
        let Event::JoinRequest { target_chat_id, user_chat_id, user_id, display_name, lang } =
            event
        else {
            return Ok(Flow::Continue);
        };
        self.challenges
            .on_join_request(*target_chat_id, *user_chat_id, *user_id, display_name, lang)
            .await?;
        Ok(Flow::Stop)
    }
}

/// Runs suspect messages through the denylist and then the classifier.
pub struct SuspectMessageHandler {
    pub db: Database,
    pub denylist: Arc<DenylistService>,
    pub classifier: Arc<dyn SpamClassifier>,
    pub consensus: Arc<SpamConsensus>,
}

const PRIOR_EXAMPLE_LIMIT: i64 = 10;

#[async_trait]
impl EventHandler for SuspectMessageHandler {
    async fn handle(&self, event: &Event) -> Result<Flow> {
        let Event::Message { chat_id, user_id, message_id, text, display_name, lang } = event
        else {
            return Ok(Flow::Continue);
        };

        let settings = self.db.settings().get(*chat_id).await?;
        if !settings.voting_enabled {
            return Ok(Flow::Continue);
        }

        if self.denylist.check_ban(*user_id).await {
            self.consensus
                .handle_banned_sender(*chat_id, *user_id, *message_id, text, display_name, lang)
                .await?;
            return Ok(Flow::Stop);
        }

        let examples = self
            .db
            .spam_cases()
            .recent_spam_examples(PRIOR_EXAMPLE_LIMIT)
            .await?;
        if self.classifier.is_spam(text, &examples).await? {
            self.consensus
                .handle_suspect(*chat_id, *user_id, *message_id, text, display_name, lang)
                .await?;
            return Ok(Flow::Stop);
        }

        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChatCache;
    use crate::config::{Defaults, DenylistConfig, SpamRule};
    use crate::classify::RuleClassifier;
    use crate::db::ChatSettings;
    use crate::i18n::Lexicon;
    use crate::restrict::RestrictionService;
    use crate::transport::mock::MockApi;
    use tokio::sync::broadcast;

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

    fn denylist_cfg() -> DenylistConfig {
        DenylistConfig {
            daily_urls: vec!["http://localhost/a".into()],
            hourly_url: "http://localhost/h".into(),
            status_url: None,
            fetch_timeout_secs: Some(1),
            retry_backoff_secs: Some(1),
            refresh_interval_secs: Some(3600),
        }
    }

    struct World {
        api: Arc<MockApi>,
        db: Database,
        denylist: Arc<DenylistService>,
        chain: HandlerChain,
    }

    async fn world() -> World {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        let lexicon = Arc::new(Lexicon::builtin());
        let cache = Arc::new(ChatCache::new());
        let restrict = Arc::new(RestrictionService::new(api.clone(), db.clone()));
        let denylist = Arc::new(DenylistService::new(db.clone(), denylist_cfg()));
        let (tx, _) = broadcast::channel(8);

        let challenges = Arc::new(ChallengeController::new(
            api.clone(),
            db.clone(),
            restrict.clone(),
            lexicon.clone(),
            cache.clone(),
            defaults(),
            tx.clone(),
        ));
        let consensus = Arc::new(SpamConsensus::new(
            api.clone(),
            db.clone(),
            restrict,
            lexicon,
            cache,
            defaults(),
            None,
            tx,
        ));
        let classifier = Arc::new(RuleClassifier::new(vec![SpamRule {
            name: "crypto".into(),
            any_keywords: vec!["airdrop".into()],
            all_keywords: vec![],
            regex: vec![],
            case_insensitive: Some(true),
        }]));

        let chain = HandlerChain::new(vec![
            Arc::new(VoteCallbackHandler { consensus: consensus.clone() }),
            Arc::new(ChallengeCallbackHandler { challenges: challenges.clone() }),
            Arc::new(JoinHandler { challenges: challenges.clone() }),
            Arc::new(JoinRequestHandler { challenges }),
            Arc::new(SuspectMessageHandler {
                db: db.clone(),
                denylist: denylist.clone(),
                classifier,
                consensus,
            }),
        ]);

        World { api, db, denylist, chain }
    }

    #[tokio::test]
    async fn malformed_callback_falls_through_unhandled() {
        let w = world().await;
        w.chain
            .dispatch(&Event::Callback {
                callback_id: "cb".into(),
                chat_id: -1,
                from_user: 5,
                payload: "???garbage???".into(),
                lang: "en".into(),
            })
            .await;
        assert!(w.api.calls().is_empty());
    }

    #[tokio::test]
    async fn join_event_reaches_the_challenge_controller() {
        let w = world().await;
        w.db.settings()
            .upsert(&ChatSettings {
                chat_id: -1,
                gatekeeper_enabled: true,
                ..ChatSettings::default()
            })
            .await
            .unwrap();

        w.chain
            .dispatch(&Event::NewMember {
                chat_id: -1,
                user_id: 5,
                display_name: "alice".into(),
                join_msg_id: None,
                lang: "en".into(),
            })
            .await;
        assert!(w.db.challenges().get(-1, 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn suspect_message_opens_a_case() {
        let w = world().await;
        w.db.settings()
            .upsert(&ChatSettings {
                chat_id: -1,
                voting_enabled: true,
                ..ChatSettings::default()
            })
            .await
            .unwrap();

        w.chain
            .dispatch(&Event::Message {
                chat_id: -1,
                user_id: 5,
                message_id: 77,
                text: "free AIRDROP for everyone".into(),
                display_name: "mallory".into(),
                lang: "en".into(),
            })
            .await;
        assert!(w.db.spam_cases().pending_for(-1, 5).await.unwrap().is_some());
        assert!(w.api.has_call("delete_message chat=-1 msg=77"));
    }

    #[tokio::test]
    async fn clean_message_in_quiet_chat_is_ignored() {
        let w = world().await;
        w.chain
            .dispatch(&Event::Message {
                chat_id: -1,
                user_id: 5,
                message_id: 77,
                text: "hello world".into(),
                display_name: "alice".into(),
                lang: "en".into(),
            })
            .await;
        assert!(w.api.calls().is_empty());
    }

    #[tokio::test]
    async fn denylisted_sender_skips_the_vote() {
        let w = world().await;
        w.db.settings()
            .upsert(&ChatSettings {
                chat_id: -1,
                voting_enabled: true,
                ..ChatSettings::default()
            })
            .await
            .unwrap();
        w.denylist.set_known_banned(&[5].into_iter().collect());

        w.chain
            .dispatch(&Event::Message {
                chat_id: -1,
                user_id: 5,
                message_id: 77,
                text: "anything at all".into(),
                display_name: "mallory".into(),
                lang: "en".into(),
            })
            .await;
        assert!(w.api.has_call("ban chat=-1 user=5"));
        assert!(!w.api.has_call("send_keyboard"));
    }
}
