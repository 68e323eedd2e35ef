use crate::types::Service;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use time::macros::{offset, time};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset, Weekday};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A candidate appointment start. Transient: offered to the caller, never booked directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub date: Date,
    pub time: Time,
    pub duration_minutes: u32,
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Free,
    /// The requested slot is taken or outside opening hours. `alternatives` holds every free slot
    /// of the requested day, in chronological order.
    Conflict { alternatives: Vec<AvailabilitySlot> },
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    /// One booking per key. The call id plus the session generation, so retried webhooks
    /// cannot double book while a later session on a reused call id books afresh.
    pub idempotency_key: String,
    pub date: Date,
    pub time: Time,
    pub service: Service,
    pub customer_name: String,
    pub caller: String,
}

impl BookingRequest {
    pub fn interval(&self) -> Interval {
        Interval::new(self.date, self.time, self.service.duration_minutes())
    }
}

/// Answer for a key that already has a booking: the same reference when the stored interval is
/// the one requested, a refusal otherwise.
pub fn replay(booking_ref: String, stored: Interval, request: &BookingRequest) -> BookingResult {
    if stored == request.interval() {
        BookingResult::Booked {
            booking_ref,
            replayed: true,
        }
    } else {
        warn!(key=%request.idempotency_key, %booking_ref, "idempotency key reused for another slot");
        BookingResult::KeyReused { booking_ref }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingResult {
    /// `replayed` is set when the idempotency key already had a booking.
    Booked { booking_ref: String, replayed: bool },
    Conflict { alternatives: Vec<AvailabilitySlot> },
    /// The key already holds a booking for a different interval. Nothing was written.
    KeyReused { booking_ref: String },
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar request timed out")]
    Timeout,
    #[error("calendar backend error: {0}")]
    Backend(String),
}

/// The calendar that owns availability and bookings. It is the single source of truth: nothing
/// above it caches availability beyond one turn.
#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn check_availability(
        &self,
        date: Date,
        time: Time,
        duration_minutes: u32,
    ) -> Result<Availability, CalendarError>;

    /// Every free start on `date` for an appointment of `duration_minutes`, in order.
    async fn free_slots(
        &self,
        date: Date,
        duration_minutes: u32,
    ) -> Result<Vec<AvailabilitySlot>, CalendarError>;

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingResult, CalendarError>;

    async fn ping(&self) -> Result<(), CalendarError>;
}

/// A booked stretch of shop-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: PrimitiveDateTime,
    pub end: PrimitiveDateTime,
}

impl Interval {
    pub fn new(date: Date, time: Time, duration_minutes: u32) -> Self {
        let start = PrimitiveDateTime::new(date, time);
        Self {
            start,
            end: start + Duration::minutes(i64::from(duration_minutes)),
        }
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Opening hours and slot grid of the shop, in its fixed UTC offset.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    pub opens: Time,
    pub closes: Time,
    pub closed_days: Vec<Weekday>,
    pub step_minutes: u32,
    pub offset: UtcOffset,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            opens: time!(09:00),
            closes: time!(20:00),
            closed_days: vec![Weekday::Sunday],
            step_minutes: 15,
            offset: offset!(+2),
        }
    }
}

impl BusinessHours {
    pub fn local_now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }

    pub fn is_open_on(&self, date: Date) -> bool {
        !self.closed_days.contains(&date.weekday())
    }

    /// Whether an appointment fits: open day, inside opening hours, not in the past, and clear of
    /// every busy interval.
    pub fn is_free(&self, slot: &Interval, busy: &[Interval], now: PrimitiveDateTime) -> bool {
        let date = slot.start.date();
        self.is_open_on(date)
            && slot.start >= PrimitiveDateTime::new(date, self.opens)
            && slot.end <= PrimitiveDateTime::new(date, self.closes)
            && slot.start >= now
            && !busy.iter().any(|b| b.overlaps(slot))
    }

    /// Every free start on the slot grid of `date` for an appointment of `duration_minutes`.
    pub fn free_slots(
        &self,
        date: Date,
        duration_minutes: u32,
        busy: &[Interval],
        now: PrimitiveDateTime,
    ) -> Vec<AvailabilitySlot> {
        let mut slots = Vec::new();
        if !self.is_open_on(date) || self.step_minutes == 0 {
            return slots;
        }
        let step = Duration::minutes(i64::from(self.step_minutes));
        let mut start = self.opens;
        loop {
            let candidate = Interval::new(date, start, duration_minutes);
            if candidate.end > PrimitiveDateTime::new(date, self.closes)
                || candidate.end.date() != date
            {
                break;
            }
            if self.is_free(&candidate, busy, now) {
                slots.push(AvailabilitySlot {
                    date,
                    time: start,
                    duration_minutes,
                    free: true,
                });
            }
            let next = start + step;
            if next <= start {
                // wrapped past midnight
                break;
            }
            start = next;
        }
        slots
    }

    pub fn availability(
        &self,
        date: Date,
        time: Time,
        duration_minutes: u32,
        busy: &[Interval],
        now: PrimitiveDateTime,
    ) -> Availability {
        let requested = Interval::new(date, time, duration_minutes);
        if self.is_free(&requested, busy, now) {
            Availability::Free
        } else {
            Availability::Conflict {
                alternatives: self.free_slots(date, duration_minutes, busy, now),
            }
        }
    }
}

/// Short, speakable booking reference.
pub fn new_booking_ref() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase()
}

struct StoredBooking {
    booking_ref: String,
    idempotency_key: String,
    interval: Interval,
}

/// Process-local calendar, used when no database is configured and in tests.
pub struct MemoryCalendar {
    hours: BusinessHours,
    bookings: Mutex<Vec<StoredBooking>>,
}

impl MemoryCalendar {
    pub fn new(hours: BusinessHours) -> Self {
        Self {
            hours,
            bookings: Mutex::new(Vec::new()),
        }
    }

    fn busy_on(bookings: &[StoredBooking], date: Date) -> Vec<Interval> {
        bookings
            .iter()
            .filter(|b| b.interval.start.date() == date)
            .map(|b| b.interval)
            .collect()
    }

    #[cfg(test)]
    pub fn booking_refs(&self) -> Vec<String> {
        self.bookings
            .lock()
            .map(|b| b.iter().map(|b| b.booking_ref.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CalendarBackend for MemoryCalendar {
    async fn check_availability(
        &self,
        date: Date,
        time: Time,
        duration_minutes: u32,
    ) -> Result<Availability, CalendarError> {
        let bookings = self
            .bookings
            .lock()
            .map_err(|_| CalendarError::Backend("booking table poisoned".to_string()))?;
        let busy = Self::busy_on(&bookings, date);
        Ok(self
            .hours
            .availability(date, time, duration_minutes, &busy, self.hours.local_now()))
    }

    async fn free_slots(
        &self,
        date: Date,
        duration_minutes: u32,
    ) -> Result<Vec<AvailabilitySlot>, CalendarError> {
        let bookings = self
            .bookings
            .lock()
            .map_err(|_| CalendarError::Backend("booking table poisoned".to_string()))?;
        let busy = Self::busy_on(&bookings, date);
        Ok(self
            .hours
            .free_slots(date, duration_minutes, &busy, self.hours.local_now()))
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingResult, CalendarError> {
        let mut bookings = self
            .bookings
            .lock()
            .map_err(|_| CalendarError::Backend("booking table poisoned".to_string()))?;
        if let Some(existing) = bookings
            .iter()
            .find(|b| b.idempotency_key == request.idempotency_key)
        {
            debug!(key=%request.idempotency_key, "booking already exists for key");
            return Ok(replay(existing.booking_ref.clone(), existing.interval, request));
        }
        let duration = request.service.duration_minutes();
        let busy = Self::busy_on(&bookings, request.date);
        let now = self.hours.local_now();
        let interval = request.interval();
        if !self.hours.is_free(&interval, &busy, now) {
            return Ok(BookingResult::Conflict {
                alternatives: self.hours.free_slots(request.date, duration, &busy, now),
            });
        }
        let booking_ref = new_booking_ref();
        bookings.push(StoredBooking {
            booking_ref: booking_ref.clone(),
            idempotency_key: request.idempotency_key.clone(),
            interval,
        });
        info!(booking_ref=%booking_ref, date=%request.date, time=%request.time, "booked in memory calendar");
        Ok(BookingResult::Booked {
            booking_ref,
            replayed: false,
        })
    }

    async fn ping(&self) -> Result<(), CalendarError> {
        Ok(())
    }
}
