//! In-memory collaborators for unit tests.

use crate::booking::BookingConfirmation;
use crate::calendar::{
    Availability, AvailabilitySlot, BookingRequest, BookingResult, BusinessHours, CalendarBackend,
    CalendarError, MemoryCalendar,
};
use crate::dialog::DialogPolicy;
use crate::extractor::{ExtractError, ExtractionRequest, Extractor, RawExtraction};
use crate::notify::{Notifier, NotifyError};
use crate::orchestrator::{Collaborators, Orchestrator, TurnLimits};
use crate::prompts::ShopInfo;
use crate::session::CallSession;
use crate::session_store::{MemorySessionStore, SessionStore, StoreError};
use crate::utils::RetryPolicy;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::{Date, OffsetDateTime, Time};

/// An orchestrator over in-memory collaborators with the given model replies.
pub fn memory_orchestrator(replies: Vec<(&str, Value)>) -> Orchestrator {
    Orchestrator::new(
        Collaborators {
            store: Arc::new(MemorySessionStore::new(time::Duration::minutes(10))),
            extractor: Arc::new(ScriptedExtractor::new(replies)),
            calendar: Arc::new(MemoryCalendar::new(BusinessHours::default())),
            notifier: Arc::new(RecordingNotifier::default()),
        },
        DialogPolicy::default(),
        TurnLimits {
            extract_timeout: Duration::from_secs(1),
            calendar: RetryPolicy {
                timeout: Duration::from_millis(200),
                backoff: Duration::from_millis(1),
                retries: 1,
            },
            notify_timeout: Duration::from_secs(1),
            health_timeout: Duration::from_millis(200),
            max_alternatives: 3,
            lookahead_days: 7,
        },
        ShopInfo {
            name: "Mounir Cutzz".to_string(),
            address: "Beirut, Lebanon".to_string(),
            hours: BusinessHours::default(),
        },
    )
}

/// Answers each utterance with a canned model reply. Unknown utterances get a malformed answer.
#[derive(Default)]
pub struct ScriptedExtractor {
    replies: HashMap<String, Value>,
    pub calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(replies: Vec<(&str, Value)>) -> Self {
        Self {
            replies: replies
                .into_iter()
                .map(|(u, v)| (u.to_string(), v))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(&request.utterance)
            .ok_or_else(|| ExtractError::Malformed(format!("no reply for {:?}", request.utterance)))?;
        serde_json::from_value(reply.clone()).map_err(|e| ExtractError::Malformed(e.to_string()))
    }

    async fn ping(&self) -> Result<(), ExtractError> {
        Ok(())
    }
}

/// Records every confirmation it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Waits until `n` confirmations were recorded, or a second has passed.
    pub async fn wait_for(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..100 {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_confirmation(
        &self,
        caller: &str,
        confirmation: &BookingConfirmation,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError("poisoned".to_string()))?
            .push((caller.to_string(), confirmation.booking_ref.clone()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A calendar whose backend is down.
#[derive(Default)]
pub struct DownCalendar {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CalendarBackend for DownCalendar {
    async fn check_availability(
        &self,
        _date: Date,
        _time: Time,
        _duration_minutes: u32,
    ) -> Result<Availability, CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CalendarError::Backend("connection refused".to_string()))
    }

    async fn free_slots(
        &self,
        _date: Date,
        _duration_minutes: u32,
    ) -> Result<Vec<AvailabilitySlot>, CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CalendarError::Backend("connection refused".to_string()))
    }

    async fn create_booking(&self, _request: &BookingRequest) -> Result<BookingResult, CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CalendarError::Backend("connection refused".to_string()))
    }

    async fn ping(&self) -> Result<(), CalendarError> {
        Err(CalendarError::Backend("connection refused".to_string()))
    }
}

/// A memory store whose next `conflicts` saves lose the race.
pub struct ConflictingStore {
    inner: MemorySessionStore,
    conflicts: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: MemorySessionStore::new(time::Duration::minutes(10)),
            conflicts: AtomicUsize::new(conflicts),
        }
    }
}

#[async_trait]
impl SessionStore for ConflictingStore {
    async fn load(&self, call_id: &str) -> Result<Option<CallSession>, StoreError> {
        self.inner.load(call_id).await
    }

    async fn save(&self, session: &mut CallSession) -> Result<(), StoreError> {
        let lose = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(StoreError::Conflict {
                call_id: session.call_id.clone(),
            });
        }
        self.inner.save(session).await
    }

    async fn delete(&self, call_id: &str) -> Result<(), StoreError> {
        self.inner.delete(call_id).await
    }

    async fn delete_if_unchanged(&self, call_id: &str, version: i64) -> Result<bool, StoreError> {
        self.inner.delete_if_unchanged(call_id, version).await
    }

    async fn idle_since(&self, cutoff: OffsetDateTime) -> Result<Vec<CallSession>, StoreError> {
        self.inner.idle_since(cutoff).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    fn ttl(&self) -> time::Duration {
        self.inner.ttl()
    }
}
