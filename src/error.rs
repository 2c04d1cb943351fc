//! Error taxonomy for the guard core.
//!
//! Transport failures split into two classes callers care about: privilege
//! errors (the bot is not admin or lacks a specific right) and everything
//! else. Privilege errors get a distinct variant so callers can notify chat
//! admins instead of silently dropping the event.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("insufficient privileges: {0}")]
    NoPrivileges(String),

    #[error("transport error: {0}")]
    Api(String),
}

impl TransportError {
    /// Classify a raw API error by its message text. Telegram reports
    /// missing rights with a handful of well-known phrases.
    pub fn from_api_text(text: String) -> Self {
        let lower = text.to_lowercase();
        let privileged = lower.contains("not enough rights")
            || lower.contains("chat_admin_required")
            || lower.contains("need administrator rights")
            || lower.contains("user is an administrator");
        if privileged {
            TransportError::NoPrivileges(text)
        } else {
            TransportError::Api(text)
        }
    }

    pub fn is_no_privileges(&self) -> bool {
        matches!(self, TransportError::NoPrivileges(_))
    }
}

/// Error signature Telegram uses when a member lookup targets a user who
/// already left or was removed. The joiner sweep treats this as "already
/// left", not as a transient failure.
pub fn is_gone_participant(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("participant_id_invalid")
        || lower.contains("user not found")
        || lower.contains("user_not_participant")
}
