use crate::availability::{rank, AvailabilityResolver, Resolution};
use crate::calendar::{BookingRequest, BookingResult, CalendarBackend};
use crate::error::AppError;
use crate::notify::Notifier;
use crate::session::{CallSession, DialogState};
use crate::types::{Language, Service};
use crate::utils::{with_retry, RetryPolicy};

use std::sync::Arc;
use time::{Date, Time};
use tracing::{error, info, warn};

/// What the caller is told (and texted) once the appointment is in the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingConfirmation {
    pub booking_ref: String,
    pub service: Service,
    pub date: Date,
    pub time: Time,
    pub customer_name: String,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// `replayed` is set when the calendar already held this call's booking.
    Booked {
        confirmation: BookingConfirmation,
        replayed: bool,
    },
    /// The session already carries a reference; nothing was sent to the calendar.
    AlreadyBooked(String),
}

pub struct BookingFinalizer {
    resolver: Arc<AvailabilityResolver>,
    calendar: Arc<dyn CalendarBackend>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    notify_timeout: std::time::Duration,
}

impl BookingFinalizer {
    pub fn new(
        resolver: Arc<AvailabilityResolver>,
        calendar: Arc<dyn CalendarBackend>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
        notify_timeout: std::time::Duration,
    ) -> Self {
        Self {
            resolver,
            calendar,
            notifier,
            policy,
            notify_timeout,
        }
    }

    /// Commits the session's slots to the calendar. A no-op when the session is already
    /// booked. The calendar re-checks the slot and inserts under one lock, so a slot taken by
    /// another call since the caller chose it surfaces as `BookingConflict`, never as a double
    /// booking. The session's booking key is the idempotency key: a replayed commit returns the
    /// original reference, and a later session on the same call id books afresh.
    pub async fn finalize(&self, session: &CallSession) -> Result<Finalized, AppError> {
        if let Some(booking_ref) = session.booking_ref() {
            info!(call_id=%session.call_id, booking_ref, "session already booked, skipping");
            return Ok(Finalized::AlreadyBooked(booking_ref.to_string()));
        }
        if session.state() != DialogState::Booking {
            return Err(AppError::Internal(format!(
                "finalize called in state {}",
                session.state()
            )));
        }
        let details = session.slots.booking_details().ok_or_else(|| {
            AppError::Internal(format!("call {} reached booking unfilled", session.call_id))
        })?;
        let duration = details.service.duration_minutes();

        let request = BookingRequest {
            idempotency_key: session.booking_key(),
            date: details.date,
            time: details.time,
            service: details.service,
            customer_name: details.customer_name.clone(),
            caller: session.caller.clone(),
        };
        let result = with_retry("create_booking", self.policy, || {
            self.calendar.create_booking(&request)
        })
        .await
        .map_err(|e| {
            error!(error=%e, call_id=%session.call_id, "booking failed after retry");
            AppError::BookingUnavailable(e.to_string())
        })?;

        match result {
            BookingResult::Booked {
                booking_ref,
                replayed,
            } => {
                info!(call_id=%session.call_id, %booking_ref, replayed, "booking committed");
                Ok(Finalized::Booked {
                    confirmation: BookingConfirmation {
                        booking_ref,
                        service: details.service,
                        date: details.date,
                        time: details.time,
                        customer_name: details.customer_name,
                        language: session.language,
                    },
                    replayed,
                })
            }
            BookingResult::Conflict { alternatives } => {
                info!(call_id=%session.call_id, "slot taken at commit");
                let alternatives = if alternatives.is_empty() {
                    match self.resolver.resolve(details.date, details.time, duration).await {
                        Ok(Resolution::Alternatives(later)) => later,
                        _ => Vec::new(),
                    }
                } else {
                    rank(alternatives, details.time, self.resolver.max_alternatives())
                };
                Err(AppError::BookingConflict { alternatives })
            }
            BookingResult::KeyReused { booking_ref } => {
                error!(call_id=%session.call_id, %booking_ref, "booking key already holds another slot");
                Err(AppError::BookingUnavailable(format!(
                    "booking {booking_ref} already holds this call's key"
                )))
            }
        }
    }

    /// Sends the confirmation on its own task. The turn never waits for it and a failure is
    /// only logged.
    pub fn dispatch_confirmation(&self, caller: &str, confirmation: BookingConfirmation) {
        let notifier = self.notifier.clone();
        let timeout = self.notify_timeout;
        let caller = caller.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.send_confirmation(&caller, &confirmation))
                .await
            {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    warn!(error=%e, booking_ref=%confirmation.booking_ref, "confirmation not delivered")
                }
                Err(_) => {
                    warn!(booking_ref=%confirmation.booking_ref, "confirmation timed out")
                }
            }
        });
    }
}
