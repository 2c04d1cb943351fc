//! Chat transport seam.
//!
//! Core logic talks to Telegram through the `ChatApi` trait so the challenge
//! controller, sweeps and consensus engine can be exercised against a
//! recording mock. The production impl wraps `teloxide::Bot`, translates
//! privilege failures into `TransportError::NoPrivileges`, and logs each
//! failure with a hint about the bot right that was probably missing.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId};
use tracing::warn;

use crate::error::{is_gone_participant, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Present,
    Left,
    Banned,
}

/// (label, callback payload) rows for an inline keyboard.
pub type KeyboardRows = Vec<Vec<(String, String)>>;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TransportError>;

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        rows: KeyboardRows,
    ) -> Result<i64, TransportError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError>;

    /// Full restriction (no posting rights) until `until_ts`.
    async fn mute_member(&self, chat_id: i64, user_id: i64, until_ts: i64)
        -> Result<(), TransportError>;

    /// Restore the default permission set.
    async fn unmute_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError>;

    /// Remove from the chat until `until_ts`, revoking their messages.
    async fn ban_member(&self, chat_id: i64, user_id: i64, until_ts: i64)
        -> Result<(), TransportError>;

    async fn unban_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError>;

    async fn approve_join_request(&self, chat_id: i64, user_id: i64)
        -> Result<(), TransportError>;

    async fn decline_join_request(&self, chat_id: i64, user_id: i64)
        -> Result<(), TransportError>;

    async fn member_status(&self, chat_id: i64, user_id: i64)
        -> Result<MemberStatus, TransportError>;

    async fn chat_title(&self, chat_id: i64) -> Result<String, TransportError>;

    async fn member_count(&self, chat_id: i64) -> Result<i64, TransportError>;

    async fn answer_callback(&self, callback_id: &str, text: &str)
        -> Result<(), TransportError>;
}

fn perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "restrict_chat_member" => "bot needs the Restrict members right",
        "ban_chat_member" | "unban_chat_member" => "bot needs the Ban users right",
        "delete_message" => "bot needs the Delete messages right",
        "approve_chat_join_request" | "decline_chat_join_request" => {
            "bot needs the Invite users right"
        }
        "send_message" => "bot must be able to post in this chat",
        _ => "check that the bot is admin with the matching right",
    }
}

pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn map_err(ctx: &str, e: teloxide::RequestError) -> TransportError {
        let err = TransportError::from_api_text(e.to_string());
        warn!("API call failed ({ctx}): {e}; hint: {}", perm_hint(ctx));
        err
    }
}

fn until(ts: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TransportError> {
        let msg = self
            .bot
            .send_message(ChatId(chat_id), text)
            .await
            .map_err(|e| Self::map_err("send_message", e))?;
        Ok(msg.id.0 as i64)
    }

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        rows: KeyboardRows,
    ) -> Result<i64, TransportError> {
        let markup = InlineKeyboardMarkup::new(rows.into_iter().map(|row| {
            row.into_iter()
                .map(|(label, payload)| InlineKeyboardButton::callback(label, payload))
                .collect::<Vec<_>>()
        }));
        let msg = self
            .bot
            .send_message(ChatId(chat_id), text)
            .reply_markup(markup)
            .await
            .map_err(|e| Self::map_err("send_message", e))?;
        Ok(msg.id.0 as i64)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map_err(|e| Self::map_err("delete_message", e))?;
        Ok(())
    }

    async fn mute_member(
        &self,
        chat_id: i64,
        user_id: i64,
        until_ts: i64,
    ) -> Result<(), TransportError> {
        self.bot
            .restrict_chat_member(ChatId(chat_id), UserId(user_id as u64), ChatPermissions::empty())
            .until_date(until(until_ts))
            .await
            .map_err(|e| Self::map_err("restrict_chat_member", e))?;
        Ok(())
    }

    async fn unmute_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.bot
            .restrict_chat_member(ChatId(chat_id), UserId(user_id as u64), ChatPermissions::all())
            .await
            .map_err(|e| Self::map_err("restrict_chat_member", e))?;
        Ok(())
    }

    async fn ban_member(
        &self,
        chat_id: i64,
        user_id: i64,
        until_ts: i64,
    ) -> Result<(), TransportError> {
        self.bot
            .ban_chat_member(ChatId(chat_id), UserId(user_id as u64))
            .until_date(until(until_ts))
            .revoke_messages(true)
            .await
            .map_err(|e| Self::map_err("ban_chat_member", e))?;
        Ok(())
    }

    async fn unban_member(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.bot
            .unban_chat_member(ChatId(chat_id), UserId(user_id as u64))
            .await
            .map_err(|e| Self::map_err("unban_chat_member", e))?;
        Ok(())
    }

    async fn approve_join_request(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.bot
            .approve_chat_join_request(ChatId(chat_id), UserId(user_id as u64))
            .await
            .map_err(|e| Self::map_err("approve_chat_join_request", e))?;
        Ok(())
    }

    async fn decline_join_request(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.bot
            .decline_chat_join_request(ChatId(chat_id), UserId(user_id as u64))
            .await
            .map_err(|e| Self::map_err("decline_chat_join_request", e))?;
        Ok(())
    }

    async fn member_status(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<MemberStatus, TransportError> {
        let member = self
            .bot
            .get_chat_member(ChatId(chat_id), UserId(user_id as u64))
            .await
            .map_err(|e| {
                // Telegram answers with an error, not a status, for users it
                // no longer tracks in the chat.
                let text = e.to_string();
                if is_gone_participant(&text) {
                    TransportError::Api(text)
                } else {
                    Self::map_err("get_chat_member", e)
                }
            })?;
        Ok(if member.is_banned() {
            MemberStatus::Banned
        } else if member.is_left() {
            MemberStatus::Left
        } else {
            MemberStatus::Present
        })
    }

    async fn chat_title(&self, chat_id: i64) -> Result<String, TransportError> {
        let chat = self
            .bot
            .get_chat(ChatId(chat_id))
            .await
            .map_err(|e| Self::map_err("get_chat", e))?;
        Ok(chat.title().unwrap_or_default().to_string())
    }

    async fn member_count(&self, chat_id: i64) -> Result<i64, TransportError> {
        let count = self
            .bot
            .get_chat_member_count(ChatId(chat_id))
            .await
            .map_err(|e| Self::map_err("get_chat_member_count", e))?;
        Ok(count as i64)
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TransportError> {
        self.bot
            .answer_callback_query(callback_id.to_string())
            .text(text)
            .await
            .map_err(|e| Self::map_err("answer_callback_query", e))?;
        Ok(())
    }
}
