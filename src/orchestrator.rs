use crate::availability::{AvailabilityResolver, Resolution};
use crate::booking::{BookingConfirmation, BookingFinalizer, Finalized};
use crate::calendar::CalendarBackend;
use crate::consts::HISTORY_LINES;
use crate::dialog::{self, BookingOutcome, Cue, DialogPolicy};
use crate::error::{handle_error, AppError};
use crate::extractor::{extract_turn, Extraction, ExtractionRequest, Extractor};
use crate::notify::Notifier;
use crate::prompts::{self, ShopInfo};
use crate::session::{CallSession, DialogState, Speaker};
use crate::session_store::{SessionStore, StoreError};
use crate::types::{Language, Service};
use crate::utils::RetryPolicy;

use futures_util::future::join4;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// The external systems a call depends on.
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub extractor: Arc<dyn Extractor>,
    pub calendar: Arc<dyn CalendarBackend>,
    /// Twilio: sends the SMS and carries the call's speech.
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct TurnLimits {
    pub extract_timeout: Duration,
    pub calendar: RetryPolicy,
    pub notify_timeout: Duration,
    pub health_timeout: Duration,
    pub max_alternatives: usize,
    pub lookahead_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Spoken {
    pub language: Language,
    pub text: String,
}

/// What the telephony layer speaks back for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub prompt: String,
    pub says: Vec<Spoken>,
    /// Language of the next speech capture.
    pub language: Language,
    pub state: DialogState,
    pub end_of_call: bool,
    pub booking_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub speech_pipeline: ComponentHealth,
    pub dialog_model: ComponentHealth,
    pub calendar: ComponentHealth,
    pub session_store: ComponentHealth,
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    extractor: Arc<dyn Extractor>,
    calendar: Arc<dyn CalendarBackend>,
    notifier: Arc<dyn Notifier>,
    resolver: Arc<AvailabilityResolver>,
    finalizer: BookingFinalizer,
    policy: DialogPolicy,
    limits: TurnLimits,
    shop: ShopInfo,
}

impl Orchestrator {
    pub fn new(parts: Collaborators, policy: DialogPolicy, limits: TurnLimits, shop: ShopInfo) -> Self {
        let resolver = Arc::new(AvailabilityResolver::new(
            parts.calendar.clone(),
            limits.calendar,
            limits.max_alternatives,
            limits.lookahead_days,
        ));
        let finalizer = BookingFinalizer::new(
            resolver.clone(),
            parts.calendar.clone(),
            parts.notifier.clone(),
            limits.calendar,
            limits.notify_timeout,
        );
        Self {
            store: parts.store,
            extractor: parts.extractor,
            calendar: parts.calendar,
            notifier: parts.notifier,
            resolver,
            finalizer,
            policy,
            limits,
            shop,
        }
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    fn respond(&self, session: &CallSession, cue: &Cue) -> TurnResponse {
        let text = prompts::render(session, cue, &self.shop);
        TurnResponse {
            prompt: text.clone(),
            says: vec![Spoken {
                language: session.language,
                text,
            }],
            language: session.language,
            state: session.state(),
            end_of_call: session.state().is_terminal(),
            booking_ref: session.booking_ref().map(str::to_string),
        }
    }

    /// Answers an incoming call. A new call is greeted in both languages; a call that is already
    /// under way (a repeated webhook) hears its current question again.
    pub async fn greet(&self, call_id: &str, caller: &str) -> TurnResponse {
        let now = OffsetDateTime::now_utc();
        let mut session = match self.store.get_or_create(call_id, caller, now).await {
            Ok(session) => session,
            Err(e) => {
                handle_error(&e);
                CallSession::fresh(call_id, caller, now, self.store.ttl())
            }
        };
        if session.state() != DialogState::Greeting {
            return self.respond(&session, &Cue::Ask);
        }
        session.touch(now);
        if let Err(e) = self.store.save(&mut session).await {
            warn!(error=%e, call_id, "greeting not persisted");
        }
        info!(call_id, caller, "call started");
        let says: Vec<Spoken> = [session.language, session.language.other()]
            .into_iter()
            .map(|language| Spoken {
                language,
                text: prompts::greeting(&self.shop, language),
            })
            .collect();
        TurnResponse {
            prompt: says
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            says,
            language: session.language,
            state: session.state(),
            end_of_call: false,
            booking_ref: None,
        }
    }

    /// Processes one caller utterance. Every failure is turned into something to say: a
    /// conflicting write is recomputed once from a fresh load, a second one gets a generic retry
    /// prompt, and collaborator outages end in FAILED with an apology.
    pub async fn handle_turn(&self, call_id: &str, caller: &str, utterance: &str) -> TurnResponse {
        match self.try_turn(call_id, caller, utterance).await {
            Ok(response) => return response,
            Err(AppError::StoreConflict(_)) => {
                warn!(call_id, "session changed under the turn, recomputing");
            }
            Err(e) => {
                handle_error(&e);
                return self.retry_later(call_id, caller).await;
            }
        }
        match self.try_turn(call_id, caller, utterance).await {
            Ok(response) => response,
            Err(e) => {
                handle_error(&e);
                self.retry_later(call_id, caller).await
            }
        }
    }

    async fn retry_later(&self, call_id: &str, caller: &str) -> TurnResponse {
        let now = OffsetDateTime::now_utc();
        let session = match self.store.get_or_create(call_id, caller, now).await {
            Ok(session) => session,
            Err(_) => CallSession::fresh(call_id, caller, now, self.store.ttl()),
        };
        if session.state().is_terminal() {
            return self.respond(&session, &Cue::Ask);
        }
        self.respond(&session, &Cue::RetryLater)
    }

    async fn try_turn(&self, call_id: &str, caller: &str, utterance: &str) -> Result<TurnResponse, AppError> {
        let now = OffsetDateTime::now_utc();
        let mut session = self.store.get_or_create(call_id, caller, now).await?;
        if session.state().is_terminal() {
            debug!(call_id, state=%session.state(), "turn on a finished call");
            return Ok(self.respond(&session, &Cue::Ask));
        }

        session.touch(now);
        session.turn_count += 1;
        if session.turn_count > self.policy.max_turns {
            warn!(call_id, turns=session.turn_count, "too many turns, giving up");
            session.transition(DialogState::Failed)?;
            self.store.save(&mut session).await?;
            return Ok(self.respond(&session, &Cue::Ask));
        }

        let request = ExtractionRequest {
            utterance: utterance.to_string(),
            language: session.language,
            state: session.state(),
            slots: session.slots.clone(),
            today: self.today(&session),
            offered: session.alternatives.clone(),
            history: session.history.clone(),
        };
        let extraction = extract_turn(&*self.extractor, &request, self.limits.extract_timeout).await;
        let from = session.state();
        let decision = dialog::apply(&self.policy, &mut session, &extraction)?;

        let mut cue = decision.cue;
        if decision.lookup {
            cue = self.offer_free(&mut session, &extraction).await;
        }
        if decision.check_slot {
            cue = self.check_slot(&mut session, cue).await?;
        }
        let mut booked = None;
        if decision.book {
            let (settled, confirmation) = self.book(&mut session).await?;
            cue = settled;
            booked = confirmation;
        }

        let response = self.respond(&session, &cue);
        session.remember(Speaker::Caller, utterance, HISTORY_LINES);
        session.remember(Speaker::Receptionist, &response.prompt, HISTORY_LINES);
        self.store.save(&mut session).await?;
        info!(
            call_id,
            intent=%extraction.intent,
            from=%from,
            to=%session.state(),
            language=%session.language,
            turn=session.turn_count,
            "turn handled"
        );
        if let Some(confirmation) = booked {
            self.finalizer
                .dispatch_confirmation(&session.caller, confirmation);
        }
        Ok(response)
    }

    /// The call's start date in shop time. Relative dates resolve against it.
    fn today(&self, session: &CallSession) -> time::Date {
        session.created_at.to_offset(self.shop.hours.offset).date()
    }

    /// Looks up free slots for the day the caller asked about and offers them.
    async fn offer_free(&self, session: &mut CallSession, extraction: &Extraction) -> Cue {
        let slots = &session.slots;
        let day = extraction
            .delta
            .date
            .or(slots.date.as_ref().map(|d| d.value))
            .unwrap_or_else(|| self.today(session));
        let preferred = extraction.delta.time.or(slots.time.as_ref().map(|t| t.value));
        // without a service yet, the length of a haircut
        let duration = extraction
            .delta
            .service
            .or(slots.service.as_ref().map(|s| s.value))
            .unwrap_or(Service::Haircut)
            .duration_minutes();
        match self.resolver.free_on(day, preferred, duration).await {
            Ok(free) => {
                info!(call_id=%session.call_id, %day, offered=free.len(), "free slots offered");
                session.alternatives = free;
                Cue::Availability(day)
            }
            Err(e) => {
                warn!(error=%e, call_id=%session.call_id, "free slots unknown");
                Cue::RetryLater
            }
        }
    }

    /// Checks the slot before the caller is asked to confirm it. An outage here is not fatal:
    /// the commit checks again.
    async fn check_slot(&self, session: &mut CallSession, cue: Cue) -> Result<Cue, AppError> {
        let Some(details) = session.slots.booking_details() else {
            return Ok(cue);
        };
        match self
            .resolver
            .resolve(details.date, details.time, details.service.duration_minutes())
            .await
        {
            Ok(Resolution::Free) => Ok(cue),
            Ok(Resolution::Alternatives(alternatives)) => {
                info!(call_id=%session.call_id, offered=alternatives.len(), "requested slot taken");
                dialog::settle_availability(session, alternatives)
            }
            Err(e) => {
                warn!(error=%e, call_id=%session.call_id, "availability unknown, confirming anyway");
                Ok(cue)
            }
        }
    }

    async fn book(&self, session: &mut CallSession) -> Result<(Cue, Option<BookingConfirmation>), AppError> {
        match self.finalizer.finalize(session).await {
            Ok(Finalized::Booked { confirmation, .. }) => {
                let cue = dialog::settle_booking(
                    session,
                    BookingOutcome::Booked(confirmation.booking_ref.clone()),
                )?;
                Ok((cue, Some(confirmation)))
            }
            Ok(Finalized::AlreadyBooked(booking_ref)) => {
                let cue = dialog::settle_booking(session, BookingOutcome::Booked(booking_ref))?;
                Ok((cue, None))
            }
            Err(AppError::BookingConflict { alternatives }) => {
                let cue = dialog::settle_booking(session, BookingOutcome::Conflict(alternatives))?;
                Ok((cue, None))
            }
            Err(e @ (AppError::AvailabilityUnavailable(_) | AppError::BookingUnavailable(_))) => {
                error!(error=%e, call_id=%session.call_id, "booking failed");
                let cue = dialog::settle_booking(session, BookingOutcome::Unavailable)?;
                Ok((cue, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Telephony reported the call over. An unfinished session becomes ABANDONED.
    pub async fn end_call(&self, call_id: &str) -> Result<(), AppError> {
        for _ in 0..2 {
            let Some(mut session) = self.store.load(call_id).await? else {
                return Ok(());
            };
            if session.state().is_terminal() {
                return Ok(());
            }
            session.transition(DialogState::Abandoned)?;
            match self.store.save(&mut session).await {
                Ok(()) => {
                    info!(call_id, turns=session.turn_count, "call abandoned");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::StoreConflict(call_id.to_string()))
    }

    /// Reachability of every collaborator, each check bounded by the health timeout.
    pub async fn health(&self) -> HealthReport {
        let timeout = self.limits.health_timeout;
        let (speech, model, calendar, store) = join4(
            reachability(timeout, self.notifier.ping()),
            reachability(timeout, self.extractor.ping()),
            reachability(timeout, self.calendar.ping()),
            reachability(timeout, self.store.ping()),
        )
        .await;
        HealthReport {
            healthy: speech.reachable && model.reachable && calendar.reachable && store.reachable,
            speech_pipeline: speech,
            dialog_model: model,
            calendar,
            session_store: store,
        }
    }
}

async fn reachability<E, F>(timeout: Duration, check: F) -> ComponentHealth
where
    E: std::fmt::Display,
    F: Future<Output = Result<(), E>>,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(())) => ComponentHealth {
            reachable: true,
            error: None,
        },
        Ok(Err(e)) => ComponentHealth {
            reachable: false,
            error: Some(e.to_string()),
        },
        Err(_) => ComponentHealth {
            reachable: false,
            error: Some("timed out".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{BusinessHours, MemoryCalendar};
    use crate::session_store::MemorySessionStore;
    use crate::tasks::sweep_sessions;
    use crate::testing::{ConflictingStore, DownCalendar, RecordingNotifier, ScriptedExtractor};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const FULL: &str = "I want a haircut on the 8th of January 2030 at 2pm, I'm John";
    const RING_BACK: &str = "A beard trim on the 9th of January 2030 at 4pm, I'm John";

    fn replies() -> Vec<(&'static str, serde_json::Value)> {
        vec![
            (
                FULL,
                json!({
                    "intent": "book_appointment",
                    "language": "en",
                    "slots": {"service": "haircut", "date": "2030-01-08", "time": "14:00", "customer_name": "John"}
                }),
            ),
            (
                "a haircut please",
                json!({"intent": "book_appointment", "language": "en", "slots": {"service": "haircut"}}),
            ),
            (
                "بكرا الساعة ٣ بعد الظهر",
                json!({"intent": "provide_info", "language": "ar", "slots": {"date": "2030-01-08", "time": "الساعة ٣ بعد الظهر"}}),
            ),
            (
                RING_BACK,
                json!({
                    "intent": "book_appointment",
                    "language": "en",
                    "slots": {"service": "beard trim", "date": "2030-01-09", "time": "16:00", "customer_name": "John"}
                }),
            ),
            ("yes", json!({"intent": "confirm", "language": "en"})),
            ("yes this is perfect", json!({"intent": "confirm", "language": "en"})),
            ("yes, today works", json!({"intent": "confirm", "language": "en"})),
            (
                "what do you have free on friday",
                json!({"intent": "check_availability", "language": "en", "slots": {"date": "2030-01-11"}}),
            ),
            ("12:30 works", json!({"intent": "provide_info", "language": "en", "slots": {"time": "12:30"}})),
            ("what are your prices", json!({"intent": "ask_info", "topic": "prices"})),
        ]
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<dyn SessionStore>,
        calendar: Arc<dyn CalendarBackend>,
        memory_calendar: Option<Arc<MemoryCalendar>>,
        extractor: Arc<ScriptedExtractor>,
        notifier: Arc<RecordingNotifier>,
    }

    fn limits() -> TurnLimits {
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
        }
    }

    fn shop() -> ShopInfo {
        ShopInfo {
            name: "Mounir Cutzz".to_string(),
            address: "Beirut, Lebanon".to_string(),
            hours: BusinessHours::default(),
        }
    }

    fn harness_with(store: Arc<dyn SessionStore>, calendar: Option<Arc<dyn CalendarBackend>>) -> Harness {
        let memory_calendar = Arc::new(MemoryCalendar::new(BusinessHours::default()));
        let (calendar, memory_calendar) = match calendar {
            Some(calendar) => (calendar, None),
            None => (memory_calendar.clone() as Arc<dyn CalendarBackend>, Some(memory_calendar)),
        };
        let extractor = Arc::new(ScriptedExtractor::new(replies()));
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = Orchestrator::new(
            Collaborators {
                store: store.clone(),
                extractor: extractor.clone(),
                calendar: calendar.clone(),
                notifier: notifier.clone(),
            },
            DialogPolicy::default(),
            limits(),
            shop(),
        );
        Harness {
            orchestrator,
            store,
            calendar,
            memory_calendar,
            extractor,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(MemorySessionStore::new(time::Duration::minutes(10))),
            None,
        )
    }

    #[tokio::test]
    async fn one_turn_fills_every_slot_and_confirms() {
        let h = harness();
        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", FULL).await;
        assert_eq!(resp.state, DialogState::Confirm);
        assert_eq!(
            resp.prompt,
            "So that's a haircut on Tuesday, January 8 at 2 PM, for John. Shall I book it?"
        );
        assert!(!resp.end_of_call);
    }

    #[tokio::test]
    async fn confirmed_booking_completes_and_replay_is_idempotent() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", FULL).await;
        let done = h.orchestrator.handle_turn("CA1", "+96170000000", "yes").await;
        assert_eq!(done.state, DialogState::Complete);
        assert!(done.end_of_call);
        let booking_ref = done.booking_ref.clone().unwrap();

        let replay = h.orchestrator.handle_turn("CA1", "+96170000000", "yes").await;
        assert_eq!(replay.booking_ref, Some(booking_ref.clone()));
        assert_eq!(replay.prompt, done.prompt);
        let calendar = h.memory_calendar.unwrap();
        assert_eq!(calendar.booking_refs(), vec![booking_ref.clone()]);

        let sent = h.notifier.wait_for(1).await;
        assert_eq!(sent, vec![("+96170000000".to_string(), booking_ref)]);
    }

    #[tokio::test]
    async fn casual_yes_still_books() {
        for answer in ["yes this is perfect", "yes, today works"] {
            let h = harness();
            h.orchestrator.handle_turn("CA1", "+96170000000", FULL).await;
            let done = h.orchestrator.handle_turn("CA1", "+96170000000", answer).await;
            assert_eq!(done.state, DialogState::Complete, "{answer}");
            let session = h.store.load("CA1").await.unwrap().unwrap();
            let details = session.slots.booking_details().unwrap();
            assert_eq!(details.customer_name, "John");
            assert_eq!(details.date, time::macros::date!(2030 - 01 - 08));
        }
    }

    #[tokio::test]
    async fn call_id_reused_after_expiry_books_the_new_slot() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", FULL).await;
        let first = h.orchestrator.handle_turn("CA1", "+96170000000", "yes").await;
        assert_eq!(first.state, DialogState::Complete);

        let mut session = h.store.load("CA1").await.unwrap().unwrap();
        session.touch(OffsetDateTime::now_utc() - time::Duration::minutes(11));
        h.store.save(&mut session).await.unwrap();

        let confirm = h.orchestrator.handle_turn("CA1", "+96170000000", RING_BACK).await;
        assert_eq!(confirm.state, DialogState::Confirm);
        assert!(confirm.prompt.starts_with("So that's a beard trim on Wednesday, January 9 at 4 PM"));
        let second = h.orchestrator.handle_turn("CA1", "+96170000000", "yes").await;
        assert_eq!(second.state, DialogState::Complete);
        assert_ne!(second.booking_ref, first.booking_ref);

        let calendar = h.memory_calendar.unwrap();
        assert_eq!(calendar.booking_refs().len(), 2);
        assert_eq!(h.notifier.wait_for(2).await.len(), 2);
    }

    #[tokio::test]
    async fn free_times_are_offered_and_taken() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        let offer = h
            .orchestrator
            .handle_turn("CA1", "+96170000000", "what do you have free on friday")
            .await;
        assert_eq!(offer.state, DialogState::CollectDatetime);
        assert_eq!(
            offer.prompt,
            "On Friday, January 11 I have 9 AM, 12:30 PM, or 4 PM free. Which works for you?"
        );

        let taken = h.orchestrator.handle_turn("CA1", "+96170000000", "12:30 works").await;
        assert_eq!(taken.state, DialogState::CollectName);
        let session = h.store.load("CA1").await.unwrap().unwrap();
        assert_eq!(
            session.slots.date.as_ref().map(|d| d.value),
            Some(time::macros::date!(2030 - 01 - 11))
        );
        assert!(session.alternatives.is_empty());
    }

    #[tokio::test]
    async fn recent_lines_are_kept_for_the_model() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        h.orchestrator
            .handle_turn("CA1", "+96170000000", "what do you have free on friday")
            .await;
        let session = h.store.load("CA1").await.unwrap().unwrap();
        let lines: Vec<(Speaker, &str)> = session
            .history
            .iter()
            .map(|e| (e.speaker, e.text.as_str()))
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], (Speaker::Caller, "a haircut please"));
        assert_eq!(
            lines[1],
            (Speaker::Receptionist, "What day and time would you like to come in?")
        );
        assert_eq!(lines[2], (Speaker::Caller, "what do you have free on friday"));
    }

    #[tokio::test]
    async fn concurrent_calls_for_one_slot_book_once() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000001", FULL).await;
        h.orchestrator.handle_turn("CA2", "+96170000002", FULL).await;
        let (a, b) = tokio::join!(
            h.orchestrator.handle_turn("CA1", "+96170000001", "yes"),
            h.orchestrator.handle_turn("CA2", "+96170000002", "yes"),
        );
        let (winner, loser) = if a.booking_ref.is_some() { (a, b) } else { (b, a) };
        assert_eq!(winner.state, DialogState::Complete);
        assert_eq!(loser.state, DialogState::CollectDatetime);
        assert!(loser.booking_ref.is_none());
        assert!(loser.prompt.starts_with("Sorry, that time is already taken. I can offer"));

        let mut sessions = Vec::new();
        for call_id in ["CA1", "CA2"] {
            sessions.push(h.store.load(call_id).await.unwrap().unwrap());
        }
        let session = sessions
            .into_iter()
            .find(|s| s.booking_ref().is_none())
            .unwrap();
        assert!(!session.alternatives.is_empty());
        assert!(session.slots.time.is_none());
        assert_eq!(h.memory_calendar.unwrap().booking_refs().len(), 1);
    }

    #[tokio::test]
    async fn language_switch_keeps_slots() {
        let h = harness();
        let first = h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        assert_eq!(first.language, Language::English);
        assert_eq!(first.state, DialogState::CollectDatetime);

        let second = h
            .orchestrator
            .handle_turn("CA1", "+96170000000", "بكرا الساعة ٣ بعد الظهر")
            .await;
        assert_eq!(second.language, Language::Arabic);
        assert_eq!(second.state, DialogState::CollectName);
        assert_eq!(second.prompt, "شو الاسم للحجز؟");
        let session = h.store.load("CA1").await.unwrap().unwrap();
        assert!(session.slots.service.is_some());
        assert!(session.slots.time.is_some());
    }

    #[tokio::test]
    async fn inactive_call_is_abandoned_then_restarts() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        let later = OffsetDateTime::now_utc() + time::Duration::minutes(11);
        let stats = sweep_sessions(
            &*h.store,
            later,
            time::Duration::minutes(10),
            time::Duration::minutes(60),
        )
        .await
        .unwrap();
        assert_eq!(stats.abandoned, 1);
        let abandoned = h.store.load("CA1").await.unwrap().unwrap();
        assert_eq!(abandoned.state(), DialogState::Abandoned);

        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", "hello?").await;
        assert_eq!(resp.state, DialogState::Greeting);
        let session = h.store.load("CA1").await.unwrap().unwrap();
        assert_eq!(session.turn_count, 1);
        assert!(session.slots.service.is_none());
    }

    #[tokio::test]
    async fn one_store_conflict_is_recomputed() {
        let store = Arc::new(ConflictingStore::new(1));
        let h = harness_with(store, None);
        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        assert_eq!(resp.state, DialogState::CollectDatetime);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_store_conflict_asks_to_repeat() {
        let store = Arc::new(ConflictingStore::new(2));
        let h = harness_with(store, None);
        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        assert_eq!(resp.state, DialogState::Greeting);
        assert!(resp.prompt.starts_with("Sorry, something went wrong on our side."));
        assert!(!resp.end_of_call);
    }

    #[tokio::test]
    async fn calendar_outage_fails_with_apology() {
        let down = Arc::new(DownCalendar::default());
        let h = harness_with(
            Arc::new(MemorySessionStore::new(time::Duration::minutes(10))),
            Some(down.clone()),
        );
        let confirm = h.orchestrator.handle_turn("CA1", "+96170000000", FULL).await;
        // availability unknown before confirming is not fatal
        assert_eq!(confirm.state, DialogState::Confirm);
        let failed = h.orchestrator.handle_turn("CA1", "+96170000000", "yes").await;
        assert_eq!(failed.state, DialogState::Failed);
        assert!(failed.end_of_call);
        assert!(failed.booking_ref.is_none());
        assert!(failed.prompt.starts_with("I'm sorry, I couldn't complete your booking."));
        assert!(h.notifier.sent().is_empty());
        assert!(down.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn silence_and_gibberish_reprompt() {
        let h = harness();
        h.orchestrator.handle_turn("CA1", "+96170000000", "a haircut please").await;
        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", "").await;
        assert_eq!(resp.state, DialogState::CollectDatetime);
        assert!(resp.prompt.starts_with("Sorry, I didn't quite get that."));
        let session = h.store.load("CA1").await.unwrap().unwrap();
        assert!(session.slots.service.is_some());
    }

    #[tokio::test]
    async fn info_questions_answer_and_repeat_the_question() {
        let h = harness();
        let resp = h
            .orchestrator
            .handle_turn("CA1", "+96170000000", "what are your prices")
            .await;
        assert_eq!(resp.state, DialogState::Greeting);
        assert!(resp.prompt.starts_with("Our prices: haircut $15"));
        assert!(resp.prompt.ends_with("How can I help you today?"));
    }

    #[tokio::test]
    async fn runaway_calls_fail() {
        let h = harness();
        for _ in 0..20 {
            h.orchestrator.handle_turn("CA1", "+96170000000", "hmm").await;
        }
        let resp = h.orchestrator.handle_turn("CA1", "+96170000000", "hmm").await;
        assert_eq!(resp.state, DialogState::Failed);
        assert!(resp.end_of_call);
    }

    #[tokio::test]
    async fn hang_up_abandons_the_session() {
        let h = harness();
        let greeting = h.orchestrator.greet("CA1", "+96170000000").await;
        assert_eq!(greeting.says.len(), 2);
        assert_eq!(greeting.says[1].language, Language::Arabic);
        h.orchestrator.end_call("CA1").await.unwrap();
        let session = h.store.load("CA1").await.unwrap().unwrap();
        assert_eq!(session.state(), DialogState::Abandoned);
        // unknown calls are fine
        h.orchestrator.end_call("CA-unknown").await.unwrap();
    }

    #[tokio::test]
    async fn health_reports_each_collaborator() {
        let h = harness();
        let report = h.orchestrator.health().await;
        assert!(report.healthy);

        let down = harness_with(
            Arc::new(MemorySessionStore::new(time::Duration::minutes(10))),
            Some(Arc::new(DownCalendar::default())),
        );
        let report = down.orchestrator.health().await;
        assert!(!report.healthy);
        assert!(!report.calendar.reachable);
        assert!(report.session_store.reachable);
        assert!(down.calendar.ping().await.is_err());
    }
}
