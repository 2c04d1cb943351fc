//! Restriction service: mute/ban/unmute/unban against the transport, each
//! paired with a `user_restrictions` row so liveness queries never need a
//! transport round-trip. Privilege failures propagate as the distinguished
//! `TransportError::NoPrivileges` for callers to react to.

use std::sync::Arc;

use crate::db::{now_ts, Database, RestrictionKind};
use crate::error::TransportError;
use crate::transport::ChatApi;

pub struct RestrictionService {
    api: Arc<dyn ChatApi>,
    db: Database,
}

impl RestrictionService {
    pub fn new(api: Arc<dyn ChatApi>, db: Database) -> Self {
        Self { api, db }
    }

    pub async fn mute(
        &self,
        chat_id: i64,
        user_id: i64,
        duration_secs: i64,
        reason: &str,
    ) -> Result<(), TransportError> {
        let now = now_ts();
        let until = now + duration_secs;
        self.api.mute_member(chat_id, user_id, until).await?;
        if let Err(e) = self
            .db
            .restrictions()
            .insert(user_id, chat_id, RestrictionKind::Mute, now, until, reason)
            .await
        {
            tracing::warn!(user_id, chat_id, error = %e, "failed to record mute");
        }
        Ok(())
    }

    pub async fn unmute(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.api.unmute_member(chat_id, user_id).await?;
        if let Err(e) = self
            .db
            .restrictions()
            .clear(user_id, chat_id, RestrictionKind::Mute)
            .await
        {
            tracing::warn!(user_id, chat_id, error = %e, "failed to clear mute record");
        }
        Ok(())
    }

    pub async fn ban(
        &self,
        chat_id: i64,
        user_id: i64,
        duration_secs: i64,
        reason: &str,
    ) -> Result<(), TransportError> {
        let now = now_ts();
        let until = now + duration_secs;
        self.api.ban_member(chat_id, user_id, until).await?;
        if let Err(e) = self
            .db
            .restrictions()
            .insert(user_id, chat_id, RestrictionKind::Ban, now, until, reason)
            .await
        {
            tracing::warn!(user_id, chat_id, error = %e, "failed to record ban");
        }
        Ok(())
    }

    pub async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), TransportError> {
        self.api.unban_member(chat_id, user_id).await?;
        if let Err(e) = self
            .db
            .restrictions()
            .clear(user_id, chat_id, RestrictionKind::Ban)
            .await
        {
            tracing::warn!(user_id, chat_id, error = %e, "failed to clear ban record");
        }
        Ok(())
    }

    pub async fn is_restricted(&self, chat_id: i64, user_id: i64) -> bool {
        self.db
            .restrictions()
            .is_restricted(user_id, chat_id, now_ts())
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockApi;

    #[tokio::test]
    async fn mute_records_row_and_unmute_clears_it() {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        let svc = RestrictionService::new(api.clone(), db.clone());

        svc.mute(-10, 5, 300, "challenge pending").await.unwrap();
        assert!(api.has_call("mute chat=-10 user=5"));
        assert!(svc.is_restricted(-10, 5).await);

        svc.unmute(-10, 5).await.unwrap();
        assert!(!svc.is_restricted(-10, 5).await);
    }

    #[tokio::test]
    async fn ban_records_row_and_unban_clears_it() {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        let svc = RestrictionService::new(api.clone(), db.clone());

        svc.ban(-10, 5, 600, "spam").await.unwrap();
        assert!(api.has_call("ban chat=-10 user=5"));
        assert!(svc.is_restricted(-10, 5).await);

        svc.unban(-10, 5).await.unwrap();
        assert!(api.has_call("unban chat=-10 user=5"));
        assert!(!svc.is_restricted(-10, 5).await);
    }

    #[tokio::test]
    async fn privilege_failure_skips_the_row() {
        let db = Database::open(":memory:").await.unwrap();
        let api = Arc::new(MockApi::new());
        api.privilege_failures.lock().unwrap().push("ban_member");
        let svc = RestrictionService::new(api.clone(), db.clone());

        let err = svc.ban(-10, 5, 600, "spam").await.unwrap_err();
        assert!(err.is_no_privileges());
        assert!(!svc.is_restricted(-10, 5).await);
    }
}
