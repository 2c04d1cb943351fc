use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{CallbackQuery, ChatJoinRequest, Message, User},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

mod cache;
mod captcha;
mod challenge;
mod classify;
mod config;
mod consensus;
mod db;
mod denylist;
mod error;
mod gatekeeper;
mod handlers;
mod i18n;
mod restrict;
mod transport;

use cache::ChatCache;
use challenge::ChallengeController;
use classify::RuleClassifier;
use config::{load_config, parse_config_arg, validate_config};
use consensus::SpamConsensus;
use db::Database;
use denylist::DenylistService;
use gatekeeper::Gatekeeper;
use handlers::{
    ChallengeCallbackHandler, Event, HandlerChain, JoinHandler, JoinRequestHandler,
    SuspectMessageHandler, VoteCallbackHandler,
};
use i18n::Lexicon;
use restrict::RestrictionService;
use transport::{ChatApi, TelegramApi};

fn user_lang(user: &User) -> String {
    user.language_code.clone().unwrap_or_else(|| "en".into())
}

fn events_from_message(msg: &Message) -> Vec<Event> {
    let chat_id = msg.chat.id.0;

    if let Some(members) = msg.new_chat_members() {
        return members
            .iter()
            .filter(|u| !u.is_bot)
            .map(|u| Event::NewMember {
                chat_id,
                user_id: u.id.0 as i64,
                display_name: u.full_name(),
                join_msg_id: Some(msg.id.0 as i64),
                lang: user_lang(u),
            })
            .collect();
    }

    if msg.chat.is_private() {
        return Vec::new();
    }

    let (Some(from), Some(text)) = (msg.from.as_ref(), msg.text()) else {
        return Vec::new();
    };
    vec![Event::Message {
        chat_id,
        user_id: from.id.0 as i64,
        message_id: msg.id.0 as i64,
        text: text.to_string(),
        display_name: from.full_name(),
        lang: user_lang(from),
    }]
}

fn event_from_callback(q: &CallbackQuery) -> Option<Event> {
    let payload = q.data.clone()?;
    let chat_id = q.message.as_ref().map(|m| m.chat().id.0)?;
    Some(Event::Callback {
        callback_id: q.id.clone(),
        chat_id,
        from_user: q.from.id.0 as i64,
        payload,
        lang: user_lang(&q.from),
    })
}

fn event_from_join_request(req: &ChatJoinRequest) -> Event {
    Event::JoinRequest {
        target_chat_id: req.chat.id.0,
        user_chat_id: req.user_chat_id.0,
        user_id: req.from.id.0 as i64,
        display_name: req.from.full_name(),
        lang: user_lang(&req.from),
    }
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(
            |chain: Arc<HandlerChain>, msg: Message| async move {
                for event in events_from_message(&msg) {
                    chain.dispatch(&event).await;
                }
                Ok(())
            },
        ))
        .branch(Update::filter_callback_query().endpoint(
            |chain: Arc<HandlerChain>, q: CallbackQuery| async move {
                if let Some(event) = event_from_callback(&q) {
                    chain.dispatch(&event).await;
                }
                Ok(())
            },
        ))
        .branch(Update::filter_chat_join_request().endpoint(
            |chain: Arc<HandlerChain>, req: ChatJoinRequest| async move {
                chain.dispatch(&event_from_join_request(&req)).await;
                Ok(())
            },
        ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (shutdown_tx, mut shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let db = Database::open(&cfg.storage.path).await?;

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await?;
    info!(
        username = %me.user.username.as_deref().unwrap_or("bot"),
        "starting"
    );

    let api: Arc<dyn ChatApi> = Arc::new(TelegramApi::new(bot.clone()));
    let lexicon = Arc::new(Lexicon::builtin());
    let cache = Arc::new(ChatCache::new());
    let restrict = Arc::new(RestrictionService::new(api.clone(), db.clone()));
    let denylist = Arc::new(DenylistService::new(db.clone(), cfg.denylist.clone()));

    let challenges = Arc::new(ChallengeController::new(
        api.clone(),
        db.clone(),
        restrict.clone(),
        lexicon.clone(),
        cache.clone(),
        cfg.defaults.clone(),
        shutdown_tx.clone(),
    ));
    let consensus = Arc::new(SpamConsensus::new(
        api.clone(),
        db.clone(),
        restrict.clone(),
        lexicon.clone(),
        cache.clone(),
        cfg.defaults.clone(),
        cfg.debug_chat_id,
        shutdown_tx.clone(),
    ));
    let classifier = Arc::new(RuleClassifier::new(cfg.spam_rules.clone()));
    let gatekeeper = Arc::new(Gatekeeper::new(
        api.clone(),
        db.clone(),
        denylist.clone(),
        restrict.clone(),
        challenges.clone(),
        cfg.debug_chat_id,
        cfg.sweeps.joiner_interval_secs,
        cfg.sweeps.expiry_interval_secs,
    ));

    if let Err(e) = denylist.bootstrap(&mut shutdown_rx0).await {
        warn!(error = %e, "denylist bootstrap failed, starting with cached rows");
    }

    let denylist_bg = denylist.clone();
    let h_denylist = tokio::spawn({
        let rx = shutdown_tx.subscribe();
        async move { denylist_bg.run(rx).await }
    });
    let h_joiners = tokio::spawn(gatekeeper.clone().run_joiner_sweep(shutdown_tx.subscribe()));
    let h_expiry = tokio::spawn(gatekeeper.run_expiry_sweep(shutdown_tx.subscribe()));

    let chain = Arc::new(HandlerChain::new(vec![
        Arc::new(VoteCallbackHandler { consensus: consensus.clone() }),
        Arc::new(ChallengeCallbackHandler { challenges: challenges.clone() }),
        Arc::new(JoinHandler { challenges: challenges.clone() }),
        Arc::new(JoinRequestHandler { challenges }),
        Arc::new(SuspectMessageHandler {
            db,
            denylist,
            classifier,
            consensus,
        }),
    ]));

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![chain])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_denylist.await;
    let _ = h_joiners.await;
    let _ = h_expiry.await;

    Ok(())
}
