use crate::calendar::AvailabilitySlot;
use crate::error::AppError;
use crate::types::{Language, Service};

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Duration, OffsetDateTime, Time};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Receptionist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogState {
    Greeting,
    CollectService,
    CollectDatetime,
    CollectName,
    Confirm,
    Booking,
    Complete,
    Abandoned,
    Failed,
}

impl DialogState {
    pub const ALL: [DialogState; 9] = [
        DialogState::Greeting,
        DialogState::CollectService,
        DialogState::CollectDatetime,
        DialogState::CollectName,
        DialogState::Confirm,
        DialogState::Booking,
        DialogState::Complete,
        DialogState::Abandoned,
        DialogState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DialogState::Complete | DialogState::Abandoned | DialogState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DialogState::Greeting => "GREETING",
            DialogState::CollectService => "COLLECT_SERVICE",
            DialogState::CollectDatetime => "COLLECT_DATETIME",
            DialogState::CollectName => "COLLECT_NAME",
            DialogState::Confirm => "CONFIRM",
            DialogState::Booking => "BOOKING",
            DialogState::Complete => "COMPLETE",
            DialogState::Abandoned => "ABANDONED",
            DialogState::Failed => "FAILED",
        }
    }

    /// The transition table. Collect states only move forward (a caller may fill several slots
    /// at once). CONFIRM falls back to any collect state on a denial or a taken slot, and
    /// BOOKING falls back to date and time collection on a conflict. Terminal states have no
    /// way out.
    pub fn can_transition_to(self, next: DialogState) -> bool {
        use DialogState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Abandoned) {
            return true;
        }
        match self {
            Greeting => matches!(
                next,
                Greeting | CollectService | CollectDatetime | CollectName | Confirm
            ),
            CollectService => matches!(
                next,
                CollectService | CollectDatetime | CollectName | Confirm
            ),
            CollectDatetime => matches!(next, CollectDatetime | CollectName | Confirm),
            CollectName => matches!(next, CollectName | Confirm),
            Confirm => matches!(
                next,
                Confirm | Booking | CollectService | CollectDatetime | CollectName
            ),
            Booking => matches!(next, Complete | CollectDatetime),
            Complete | Abandoned | Failed => false,
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A filled slot value, with the turn that last wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<T> {
    pub value: T,
    pub turn: u32,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotField {
    Service,
    Date,
    Time,
    CustomerName,
}

impl SlotField {
    pub const ORDER: [SlotField; 4] = [
        SlotField::Service,
        SlotField::Date,
        SlotField::Time,
        SlotField::CustomerName,
    ];

    /// The state that asks for this slot.
    pub fn collect_state(self) -> DialogState {
        match self {
            SlotField::Service => DialogState::CollectService,
            SlotField::Date | SlotField::Time => DialogState::CollectDatetime,
            SlotField::CustomerName => DialogState::CollectName,
        }
    }
}

/// Slot values extracted from one utterance. Only fields the caller actually mentioned are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotDelta {
    pub service: Option<Service>,
    pub date: Option<Date>,
    pub time: Option<Time>,
    pub customer_name: Option<String>,
}

impl SlotDelta {
    pub fn is_empty(&self) -> bool {
        self.service.is_none()
            && self.date.is_none()
            && self.time.is_none()
            && self.customer_name.is_none()
    }

    pub fn has(&self, field: SlotField) -> bool {
        match field {
            SlotField::Service => self.service.is_some(),
            SlotField::Date => self.date.is_some(),
            SlotField::Time => self.time.is_some(),
            SlotField::CustomerName => self.customer_name.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slots {
    pub service: Option<Slot<Service>>,
    pub date: Option<Slot<Date>>,
    pub time: Option<Slot<Time>>,
    pub customer_name: Option<Slot<String>>,
}

/// Everything the calendar needs, available once all slots are filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub service: Service,
    pub date: Date,
    pub time: Time,
    pub customer_name: String,
}

impl Slots {
    /// The part of `delta` that would change a slot.
    pub fn changes(&self, delta: &SlotDelta) -> SlotDelta {
        fn differs<T: PartialEq + Clone>(current: &Option<Slot<T>>, value: &Option<T>) -> Option<T> {
            match (current, value) {
                (Some(slot), Some(v)) if slot.value == *v => None,
                (_, v) => v.clone(),
            }
        }
        SlotDelta {
            service: differs(&self.service, &delta.service),
            date: differs(&self.date, &delta.date),
            time: differs(&self.time, &delta.time),
            customer_name: differs(&self.customer_name, &delta.customer_name),
        }
    }

    /// Writes every value present in `delta`. Fields absent from the delta are left alone.
    pub fn merge(&mut self, delta: &SlotDelta, turn: u32, confidence: Option<f64>) {
        fn put<T: Clone>(slot: &mut Option<Slot<T>>, value: &Option<T>, turn: u32, confidence: Option<f64>) {
            if let Some(value) = value {
                *slot = Some(Slot {
                    value: value.clone(),
                    turn,
                    confidence,
                });
            }
        }
        put(&mut self.service, &delta.service, turn, confidence);
        put(&mut self.date, &delta.date, turn, confidence);
        put(&mut self.time, &delta.time, turn, confidence);
        put(&mut self.customer_name, &delta.customer_name, turn, confidence);
    }

    pub fn clear(&mut self, field: SlotField) {
        match field {
            SlotField::Service => self.service = None,
            SlotField::Date => self.date = None,
            SlotField::Time => self.time = None,
            SlotField::CustomerName => self.customer_name = None,
        }
    }

    pub fn is_filled(&self, field: SlotField) -> bool {
        match field {
            SlotField::Service => self.service.is_some(),
            SlotField::Date => self.date.is_some(),
            SlotField::Time => self.time.is_some(),
            SlotField::CustomerName => self.customer_name.is_some(),
        }
    }

    pub fn first_missing(&self) -> Option<SlotField> {
        SlotField::ORDER.into_iter().find(|f| !self.is_filled(*f))
    }

    /// The state the dialog belongs in for these slots: the first unsatisfied collect state,
    /// else CONFIRM.
    pub fn next_state(&self) -> DialogState {
        self.first_missing()
            .map(SlotField::collect_state)
            .unwrap_or(DialogState::Confirm)
    }

    pub fn booking_details(&self) -> Option<BookingDetails> {
        Some(BookingDetails {
            service: self.service.as_ref()?.value,
            date: self.date.as_ref()?.value,
            time: self.time.as_ref()?.value,
            customer_name: self.customer_name.as_ref()?.value.clone(),
        })
    }
}

/// Per-call conversational state. Persisted whole after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    /// New for every session on a call id, so a reused id never replays an older booking.
    pub generation: Uuid,
    pub caller: String,
    pub language: Language,
    state: DialogState,
    pub slots: Slots,
    pub turn_count: u32,
    pub confirm_retries: u32,
    /// Free slots offered after a conflict. Cleared once a date and time are settled again.
    #[serde(default)]
    pub alternatives: Vec<AvailabilitySlot>,
    booking_ref: Option<String>,
    /// The last few lines of the conversation, oldest first.
    #[serde(default)]
    pub history: Vec<Exchange>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Optimistic write guard, bumped by every successful save.
    pub version: i64,
}

impl CallSession {
    pub fn fresh(call_id: &str, caller: &str, now: OffsetDateTime, ttl: Duration) -> Self {
        Self {
            call_id: call_id.to_string(),
            generation: Uuid::new_v4(),
            caller: caller.to_string(),
            language: Language::default(),
            state: DialogState::Greeting,
            slots: Slots::default(),
            turn_count: 0,
            confirm_retries: 0,
            alternatives: Vec::new(),
            booking_ref: None,
            history: Vec::new(),
            created_at: now,
            last_active_at: now,
            expires_at: now + ttl,
            version: 0,
        }
    }

    /// A new session that takes over the stored row of an expired one.
    pub fn replacing(stale: &CallSession, caller: &str, now: OffsetDateTime, ttl: Duration) -> Self {
        let caller = if caller.is_empty() { &stale.caller } else { caller };
        Self {
            version: stale.version,
            ..Self::fresh(&stale.call_id, caller, now, ttl)
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn booking_ref(&self) -> Option<&str> {
        self.booking_ref.as_deref()
    }

    pub fn booking_key(&self) -> String {
        format!("{}:{}", self.call_id, self.generation)
    }

    /// Appends a line to the history, dropping the oldest past `keep`.
    pub fn remember(&mut self, speaker: Speaker, text: &str, keep: usize) {
        if text.is_empty() {
            return;
        }
        self.history.push(Exchange {
            speaker,
            text: text.to_string(),
        });
        let excess = self.history.len().saturating_sub(keep);
        self.history.drain(..excess);
    }

    pub fn transition(&mut self, next: DialogState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "illegal transition {} -> {} for call {}",
                self.state, next, self.call_id
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Records the booking reference. A second, different reference is refused.
    pub fn set_booking_ref(&mut self, booking_ref: &str) -> Result<(), AppError> {
        match &self.booking_ref {
            Some(existing) if existing != booking_ref => Err(AppError::Internal(format!(
                "call {} already booked as {existing}",
                self.call_id
            ))),
            _ => {
                self.booking_ref = Some(booking_ref.to_string());
                Ok(())
            }
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_active_at = now;
    }
}
