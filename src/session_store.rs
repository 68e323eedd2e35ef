use crate::error::AppError;
use crate::session::{CallSession, DialogState};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {call_id} was modified since it was loaded")]
    Conflict { call_id: String },
    #[error("session store error: {0}")]
    Backend(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { call_id } => AppError::StoreConflict(call_id),
            StoreError::Backend(msg) => AppError::Internal(msg),
        }
    }
}

/// Durable per-call state with optimistic, version-guarded writes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, call_id: &str) -> Result<Option<CallSession>, StoreError>;

    /// Persists the whole session if nobody else wrote it since it was loaded. On success the
    /// session's version is bumped and its expiry pushed to `last_active_at` plus the TTL.
    async fn save(&self, session: &mut CallSession) -> Result<(), StoreError>;

    async fn delete(&self, call_id: &str) -> Result<(), StoreError>;

    /// Deletes the row only if it is still at `version`. Returns whether a row was removed.
    async fn delete_if_unchanged(&self, call_id: &str, version: i64) -> Result<bool, StoreError>;

    /// Sessions whose last turn came before `cutoff`.
    async fn idle_since(&self, cutoff: OffsetDateTime) -> Result<Vec<CallSession>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Inactivity window after which a session expires.
    fn ttl(&self) -> Duration;

    /// Loads the session for `call_id`, or starts a fresh one. Expired and abandoned sessions
    /// are replaced transparently; the replacement inherits the stored version so its first
    /// save overwrites the old row.
    async fn get_or_create(
        &self,
        call_id: &str,
        caller: &str,
        now: OffsetDateTime,
    ) -> Result<CallSession, StoreError> {
        match self.load(call_id).await? {
            None => Ok(CallSession::fresh(call_id, caller, now, self.ttl())),
            Some(stale) if stale.is_expired(now) || stale.state() == DialogState::Abandoned => {
                let reason = AppError::SessionExpired(call_id.to_string());
                info!(call_id, state=%stale.state(), %reason, "starting a fresh session");
                Ok(CallSession::replacing(&stale, caller, now, self.ttl()))
            }
            Some(session) => Ok(session),
        }
    }
}

/// Sessions held in process memory. Used when no database is configured and in tests.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, CallSession>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CallSession>>, StoreError> {
        self.sessions
            .lock()
            .map_err(|_| StoreError::Backend("session table poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, call_id: &str) -> Result<Option<CallSession>, StoreError> {
        Ok(self.sessions()?.get(call_id).cloned())
    }

    async fn save(&self, session: &mut CallSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions()?;
        let stored_version = sessions.get(&session.call_id).map(|s| s.version);
        let current = match stored_version {
            Some(v) => v == session.version,
            None => session.version == 0,
        };
        if !current {
            return Err(StoreError::Conflict {
                call_id: session.call_id.clone(),
            });
        }
        session.version += 1;
        session.expires_at = session.last_active_at + self.ttl;
        sessions.insert(session.call_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, call_id: &str) -> Result<(), StoreError> {
        self.sessions()?.remove(call_id);
        Ok(())
    }

    async fn delete_if_unchanged(&self, call_id: &str, version: i64) -> Result<bool, StoreError> {
        let mut sessions = self.sessions()?;
        if sessions.get(call_id).map(|s| s.version) == Some(version) {
            sessions.remove(call_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn idle_since(&self, cutoff: OffsetDateTime) -> Result<Vec<CallSession>, StoreError> {
        Ok(self
            .sessions()?
            .values()
            .filter(|s| s.last_active_at < cutoff)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.sessions().map(|_| ())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2030-01-07 10:00 UTC);

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(Duration::minutes(10))
    }

    #[tokio::test]
    async fn unseen_call_yields_fresh_session() {
        let store = store();
        let session = store.get_or_create("CA1", "+9613000000", NOW).await.unwrap();
        assert_eq!(session.state(), DialogState::Greeting);
        assert_eq!(session.version, 0);
        assert!(store.load("CA1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_bumps_version_and_refreshes_expiry() {
        let store = store();
        let mut session = store.get_or_create("CA1", "+9613000000", NOW).await.unwrap();
        session.touch(NOW + Duration::minutes(3));
        store.save(&mut session).await.unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.expires_at, NOW + Duration::minutes(13));
        let loaded = store.load("CA1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let store = store();
        let mut first = store.get_or_create("CA1", "+9613000000", NOW).await.unwrap();
        let mut second = first.clone();
        store.save(&mut first).await.unwrap();
        let err = store.save(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { call_id } if call_id == "CA1"));

        // after a reload the write goes through
        let mut reloaded = store.load("CA1").await.unwrap().unwrap();
        store.save(&mut reloaded).await.unwrap();
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn expired_and_abandoned_sessions_are_replaced() {
        let store = store();
        let mut session = store.get_or_create("CA1", "+9613000000", NOW).await.unwrap();
        session.transition(DialogState::CollectService).unwrap();
        store.save(&mut session).await.unwrap();

        let later = NOW + Duration::minutes(11);
        let mut replaced = store.get_or_create("CA1", "", later).await.unwrap();
        assert_eq!(replaced.state(), DialogState::Greeting);
        assert_eq!(replaced.version, 1);
        replaced.transition(DialogState::Abandoned).unwrap();
        store.save(&mut replaced).await.unwrap();

        let again = store.get_or_create("CA1", "", later).await.unwrap();
        assert_eq!(again.state(), DialogState::Greeting);
        assert_eq!(again.caller, "+9613000000");
    }

    #[tokio::test]
    async fn guarded_delete_respects_version() {
        let store = store();
        let mut session = store.get_or_create("CA1", "+9613000000", NOW).await.unwrap();
        store.save(&mut session).await.unwrap();
        assert!(!store.delete_if_unchanged("CA1", 0).await.unwrap());
        assert_eq!(store.idle_since(NOW + Duration::minutes(1)).await.unwrap().len(), 1);
        assert!(store.delete_if_unchanged("CA1", 1).await.unwrap());
        assert!(store.load("CA1").await.unwrap().is_none());
    }
}
