use crate::calendar::AvailabilitySlot;

use thiserror::Error;
use tracing::error;

/// Failures a turn can run into. Apart from `Config`, every variant is translated into a spoken
/// prompt and a state transition before it reaches the caller.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("could not understand the caller: {0}")]
    ExtractionUnclear(String),
    #[error("session for call {0} was modified by another writer")]
    StoreConflict(String),
    #[error("availability lookup unavailable: {0}")]
    AvailabilityUnavailable(String),
    #[error("booking backend unavailable: {0}")]
    BookingUnavailable(String),
    #[error("requested slot is no longer free")]
    BookingConflict { alternatives: Vec<AvailabilitySlot> },
    #[error("session for call {0} expired")]
    SessionExpired(String),
    #[error("invalid configuration for {0}")]
    Config(String),
    #[error("{0}")]
    Internal(String),
}

pub fn handle_error(e: &dyn std::error::Error) {
    error!("ERROR: {e}")
}
