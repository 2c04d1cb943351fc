//! Explicit chat-metadata cache, owned by the composition root and passed
//! by reference to whoever needs a title or member count. Invalidation is
//! explicit; there is no global registry.

use crate::transport::ChatApi;
use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct ChatInfo {
    pub title: String,
    pub member_count: i64,
}

#[derive(Default)]
pub struct ChatCache {
    chats: DashMap<i64, ChatInfo>,
}

impl ChatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached info, fetched through `api` on first use. A failed lookup is
    /// served as empty title / zero count for this call only and never
    /// cached, so the next access retries the transport.
    pub async fn get(&self, api: &dyn ChatApi, chat_id: i64) -> ChatInfo {
        if let Some(info) = self.chats.get(&chat_id) {
            return info.clone();
        }
        let title = api.chat_title(chat_id).await;
        let member_count = api.member_count(chat_id).await;
        let complete = title.is_ok() && member_count.is_ok();
        let info = ChatInfo {
            title: title.unwrap_or_default(),
            member_count: member_count.unwrap_or(0),
        };
        if complete {
            self.chats.insert(chat_id, info.clone());
        }
        info
    }

    pub fn invalidate(&self, chat_id: i64) {
        self.chats.remove(&chat_id);
    }
}
