//! The slot-filling state machine. Pure: it reads an extraction, mutates the in-memory session
//! and says what to do next. Calendar calls and persistence happen in the orchestrator.

use crate::calendar::AvailabilitySlot;
use crate::error::AppError;
use crate::extractor::Extraction;
use crate::session::{CallSession, DialogState, SlotDelta, SlotField};
use crate::types::{InfoTopic, Intent};

use time::Date;
use tracing::{debug, info, warn};

/// Which details a bare "no" at confirmation throws away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyTarget {
    Service,
    Date,
    Time,
    DateTime,
    Name,
}

impl DenyTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Some(DenyTarget::Service),
            "date" => Some(DenyTarget::Date),
            "time" => Some(DenyTarget::Time),
            "datetime" | "date_time" => Some(DenyTarget::DateTime),
            "name" | "customer_name" => Some(DenyTarget::Name),
            _ => None,
        }
    }

    pub fn fields(self) -> Vec<SlotField> {
        match self {
            DenyTarget::Service => vec![SlotField::Service],
            DenyTarget::Date => vec![SlotField::Date],
            DenyTarget::Time => vec![SlotField::Time],
            DenyTarget::DateTime => vec![SlotField::Date, SlotField::Time],
            DenyTarget::Name => vec![SlotField::CustomerName],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialogPolicy {
    pub max_confirm_retries: u32,
    pub max_turns: u32,
    pub deny_default: DenyTarget,
}

impl Default for DialogPolicy {
    fn default() -> Self {
        Self {
            max_confirm_retries: 2,
            max_turns: 20,
            deny_default: DenyTarget::DateTime,
        }
    }
}

/// How the next prompt is framed. The state picks the question, the cue the wording around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cue {
    Ask,
    /// The last utterance was not understood.
    Unclear,
    LanguageSwitched,
    Info(Option<InfoTopic>),
    /// Free slots were looked up for the day; the session carries them as alternatives.
    Availability(Date),
    /// The chosen slot is taken; the session carries the alternatives.
    Conflict,
    /// The turn could not be saved; nothing changed.
    RetryLater,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub cue: Cue,
    /// The session entered BOOKING and must be finalized before the turn is saved.
    pub book: bool,
    /// The session entered CONFIRM with new details; the slot should be checked first.
    pub check_slot: bool,
    /// The caller asked what is free. Nothing changed; the orchestrator looks it up.
    pub lookup: bool,
}

impl Decision {
    fn say(cue: Cue) -> Self {
        Self {
            cue,
            book: false,
            check_slot: false,
            lookup: false,
        }
    }

    fn next(cue: Cue, check_slot: bool) -> Self {
        Self {
            check_slot,
            ..Self::say(cue)
        }
    }
}

/// Result of a commit attempt, as the dialog sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Booked(String),
    Conflict(Vec<AvailabilitySlot>),
    Unavailable,
}

/// Applies one extracted turn to the session.
pub fn apply(
    policy: &DialogPolicy,
    session: &mut CallSession,
    extraction: &Extraction,
) -> Result<Decision, AppError> {
    if let Some(language) = extraction.language {
        if language != session.language {
            info!(call_id=%session.call_id, from=%session.language, to=%language, "language switch");
            session.language = language;
        }
    }

    let state = session.state();
    if state.is_terminal() {
        return Ok(Decision::say(Cue::Ask));
    }
    match extraction.intent {
        Intent::ChangeLanguage => return Ok(Decision::say(Cue::LanguageSwitched)),
        Intent::AskInfo => return Ok(Decision::say(Cue::Info(extraction.topic))),
        Intent::CheckAvailability if state != DialogState::Booking => {
            return Ok(Decision {
                lookup: true,
                ..Decision::say(Cue::Ask)
            })
        }
        _ => (),
    }

    match state {
        DialogState::Confirm => confirm_turn(policy, session, extraction),
        DialogState::Booking => Ok(Decision {
            book: true,
            ..Decision::say(Cue::Ask)
        }),
        _ => collect_turn(session, extraction),
    }
}

fn collect_turn(session: &mut CallSession, extraction: &Extraction) -> Result<Decision, AppError> {
    let state = session.state();
    let mut delta = extraction.delta.clone();
    take_offered(session, extraction.intent, &mut delta);

    if state == DialogState::Greeting && delta.is_empty() && extraction.intent == Intent::Unclear {
        return Ok(Decision::say(Cue::Unclear));
    }

    session
        .slots
        .merge(&delta, session.turn_count, extraction.confidence);
    let next = guarded(session, session.slots.next_state());
    session.transition(next)?;
    if next != DialogState::CollectDatetime {
        session.alternatives.clear();
    }
    if next == DialogState::Confirm {
        session.confirm_retries = 0;
    }

    let cue = if extraction.intent == Intent::Unclear {
        Cue::Unclear
    } else {
        Cue::Ask
    };
    Ok(Decision::next(cue, next == DialogState::Confirm))
}

/// Resolves answers to offered alternatives: a bare "yes" while choosing a time takes the first
/// one, a bare time takes the date of the alternative at that time.
fn take_offered(session: &CallSession, intent: Intent, delta: &mut SlotDelta) {
    let Some(first) = session.alternatives.first() else {
        return;
    };
    if intent == Intent::Confirm
        && session.state() == DialogState::CollectDatetime
        && delta.date.is_none()
        && delta.time.is_none()
    {
        debug!(call_id=%session.call_id, "caller took the first alternative");
        delta.date = Some(first.date);
        delta.time = Some(first.time);
        return;
    }
    if let (None, Some(time)) = (delta.date, delta.time) {
        if let Some(offered) = session.alternatives.iter().find(|a| a.time == time) {
            delta.date = Some(offered.date);
        }
    }
}

fn confirm_turn(
    policy: &DialogPolicy,
    session: &mut CallSession,
    extraction: &Extraction,
) -> Result<Decision, AppError> {
    let mut delta = extraction.delta.clone();
    take_offered(session, extraction.intent, &mut delta);
    // restating a detail already on the booking is not a correction
    let delta = session.slots.changes(&delta);
    match extraction.intent {
        Intent::Confirm if delta.is_empty() => {
            session.transition(DialogState::Booking)?;
            session.alternatives.clear();
            Ok(Decision {
                book: true,
                ..Decision::say(Cue::Ask)
            })
        }
        Intent::Deny => {
            let denied = if extraction.denied.is_empty() {
                policy.deny_default.fields()
            } else {
                extraction.denied.clone()
            };
            for field in denied {
                if !delta.has(field) {
                    session.slots.clear(field);
                }
            }
            session
                .slots
                .merge(&delta, session.turn_count, extraction.confidence);
            session.confirm_retries = 0;
            let next = session.slots.next_state();
            session.transition(next)?;
            if next != DialogState::CollectDatetime {
                session.alternatives.clear();
            }
            debug!(call_id=%session.call_id, %next, "caller rejected the details");
            Ok(Decision::next(Cue::Ask, next == DialogState::Confirm))
        }
        Intent::Unclear => {
            session.confirm_retries += 1;
            if session.confirm_retries > policy.max_confirm_retries {
                warn!(call_id=%session.call_id, retries=session.confirm_retries, "confirmation never understood");
                session.transition(DialogState::Failed)?;
            }
            Ok(Decision::say(Cue::Ask))
        }
        _ if !delta.is_empty() => {
            // a correction without an explicit "no". The retry count carries over, so
            // corrections between unclear answers do not extend the confirmation.
            session
                .slots
                .merge(&delta, session.turn_count, extraction.confidence);
            session.alternatives.clear();
            Ok(Decision::next(Cue::Ask, true))
        }
        _ => Ok(Decision::say(Cue::Ask)),
    }
}

/// Falls back to staying put when the slots point somewhere the table does not allow.
fn guarded(session: &CallSession, next: DialogState) -> DialogState {
    if session.state().can_transition_to(next) {
        next
    } else {
        warn!(call_id=%session.call_id, from=%session.state(), to=%next, "holding state");
        session.state()
    }
}

/// Sends the caller back to date and time collection with the offered alternatives. The time is
/// always cleared; the date only when no alternative falls on it.
fn back_to_datetime(session: &mut CallSession, alternatives: Vec<AvailabilitySlot>) -> Result<Cue, AppError> {
    let requested = session.slots.date.as_ref().map(|d| d.value);
    let same_day = !alternatives.is_empty() && alternatives.iter().all(|a| Some(a.date) == requested);
    session.slots.clear(SlotField::Time);
    if !same_day {
        session.slots.clear(SlotField::Date);
    }
    session.alternatives = alternatives;
    session.transition(DialogState::CollectDatetime)?;
    Ok(Cue::Conflict)
}

/// The requested slot was found taken before the confirmation question was asked.
pub fn settle_availability(
    session: &mut CallSession,
    alternatives: Vec<AvailabilitySlot>,
) -> Result<Cue, AppError> {
    back_to_datetime(session, alternatives)
}

/// Moves a BOOKING session on according to the commit result.
pub fn settle_booking(session: &mut CallSession, outcome: BookingOutcome) -> Result<Cue, AppError> {
    match outcome {
        BookingOutcome::Booked(booking_ref) => {
            session.set_booking_ref(&booking_ref)?;
            session.alternatives.clear();
            session.transition(DialogState::Complete)?;
            Ok(Cue::Ask)
        }
        BookingOutcome::Conflict(alternatives) => back_to_datetime(session, alternatives),
        BookingOutcome::Unavailable => {
            session.transition(DialogState::Failed)?;
            Ok(Cue::Ask)
        }
    }
}
