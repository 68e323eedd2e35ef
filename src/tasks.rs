use crate::session::DialogState;
use crate::session_store::{SessionStore, StoreError};

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub abandoned: usize,
    pub deleted: usize,
}

/// One pass over idle sessions. Unfinished sessions silent for `inactivity` become ABANDONED;
/// any session silent for `inactivity + grace` is deleted. Rows touched by a turn since they
/// were listed are left alone.
pub async fn sweep_sessions(
    store: &dyn SessionStore,
    now: OffsetDateTime,
    inactivity: Duration,
    grace: Duration,
) -> Result<SweepStats, StoreError> {
    let mut stats = SweepStats::default();
    for mut session in store.idle_since(now - inactivity).await? {
        if session.last_active_at < now - inactivity - grace {
            if store
                .delete_if_unchanged(&session.call_id, session.version)
                .await?
            {
                debug!(call_id=%session.call_id, state=%session.state(), "session deleted");
                stats.deleted += 1;
            }
            continue;
        }
        if session.state().is_terminal() {
            continue;
        }
        if session.transition(DialogState::Abandoned).is_err() {
            continue;
        }
        match store.save(&mut session).await {
            Ok(()) => {
                info!(call_id=%session.call_id, turns=session.turn_count, "idle call abandoned");
                stats.abandoned += 1;
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(call_id=%session.call_id, "session moved on during sweep");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

/// Task that sweeps idle sessions every `interval`.
pub fn spawn_session_sweeper(
    store: Arc<dyn SessionStore>,
    interval: std::time::Duration,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let inactivity = store.ttl();
            match sweep_sessions(&*store, OffsetDateTime::now_utc(), inactivity, grace).await {
                Ok(stats) if stats != SweepStats::default() => {
                    info!(abandoned = stats.abandoned, deleted = stats.deleted, "session sweep")
                }
                Ok(_) => (),
                Err(e) => error!(error=%e, "session sweep failed"),
            }
        }
    })
}
