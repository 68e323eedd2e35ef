use crate::calendar::{Availability, AvailabilitySlot, CalendarBackend, CalendarError};
use crate::error::AppError;
use crate::utils::{with_retry, RetryPolicy};

use std::sync::Arc;
use time::{Date, Duration, Time};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Free,
    /// Nearest free slots, best first. Empty when nothing is open within the lookahead.
    Alternatives(Vec<AvailabilitySlot>),
}

/// Answers "is this slot free, and if not, what is close" against the calendar. Nothing is
/// cached: every call goes to the backend.
pub struct AvailabilityResolver {
    calendar: Arc<dyn CalendarBackend>,
    policy: RetryPolicy,
    max_alternatives: usize,
    lookahead_days: u32,
}

impl AvailabilityResolver {
    pub fn new(
        calendar: Arc<dyn CalendarBackend>,
        policy: RetryPolicy,
        max_alternatives: usize,
        lookahead_days: u32,
    ) -> Self {
        Self {
            calendar,
            policy,
            max_alternatives,
            lookahead_days,
        }
    }

    pub fn max_alternatives(&self) -> usize {
        self.max_alternatives
    }

    async fn check(&self, date: Date, time: Time, duration: u32) -> Result<Availability, AppError> {
        with_retry("check_availability", self.policy, || {
            self.calendar.check_availability(date, time, duration)
        })
        .await
        .map_err(|e: CalendarError| {
            error!(error=%e, %date, %time, "availability lookup failed after retry");
            AppError::AvailabilityUnavailable(e.to_string())
        })
    }

    pub async fn resolve(&self, date: Date, time: Time, duration: u32) -> Result<Resolution, AppError> {
        let alternatives = match self.check(date, time, duration).await? {
            Availability::Free => return Ok(Resolution::Free),
            Availability::Conflict { alternatives } => alternatives,
        };
        if !alternatives.is_empty() {
            return Ok(Resolution::Alternatives(rank(
                alternatives,
                time,
                self.max_alternatives,
            )));
        }
        debug!(%date, "nothing free on requested day, looking ahead");
        for ahead in 1..=i64::from(self.lookahead_days) {
            let Some(day) = date.checked_add(Duration::days(ahead)) else {
                break;
            };
            match self.check(day, time, duration).await? {
                Availability::Free => {
                    return Ok(Resolution::Alternatives(vec![AvailabilitySlot {
                        date: day,
                        time,
                        duration_minutes: duration,
                        free: true,
                    }]))
                }
                Availability::Conflict { alternatives } if !alternatives.is_empty() => {
                    return Ok(Resolution::Alternatives(rank(
                        alternatives,
                        time,
                        self.max_alternatives,
                    )))
                }
                Availability::Conflict { .. } => continue,
            }
        }
        Ok(Resolution::Alternatives(Vec::new()))
    }

    /// Free slots to offer for "what do you have on Friday". Near `preferred` when the caller
    /// named a time, spread over the day otherwise. A fully booked day rolls over to the next
    /// day with room, within the lookahead.
    pub async fn free_on(
        &self,
        date: Date,
        preferred: Option<Time>,
        duration: u32,
    ) -> Result<Vec<AvailabilitySlot>, AppError> {
        for ahead in 0..=i64::from(self.lookahead_days) {
            let Some(day) = date.checked_add(Duration::days(ahead)) else {
                break;
            };
            let free = with_retry("free_slots", self.policy, || {
                self.calendar.free_slots(day, duration)
            })
            .await
            .map_err(|e: CalendarError| {
                error!(error=%e, %day, "free slot lookup failed after retry");
                AppError::AvailabilityUnavailable(e.to_string())
            })?;
            if free.is_empty() {
                continue;
            }
            return Ok(match preferred {
                Some(time) => rank(free, time, self.max_alternatives),
                None => spread(free, self.max_alternatives),
            });
        }
        Ok(Vec::new())
    }
}

/// Picks up to `max` slots evenly spaced across the day.
fn spread(slots: Vec<AvailabilitySlot>, max: usize) -> Vec<AvailabilitySlot> {
    if max == 0 {
        return Vec::new();
    }
    let step = (slots.len() / max).max(1);
    slots.into_iter().step_by(step).take(max).collect()
}

/// Orders free slots by distance from the requested time, earlier first on ties, and keeps
/// the best `max`.
pub fn rank(mut slots: Vec<AvailabilitySlot>, requested: Time, max: usize) -> Vec<AvailabilitySlot> {
    slots.retain(|s| s.free);
    slots.sort_by_key(|s| (s.date, (s.time - requested).abs(), s.time));
    slots.truncate(max);
    slots
}
