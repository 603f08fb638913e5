use ulid::Ulid;

use crate::model::BookingStatus;
use crate::pricing::PricingError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    PropertyUnavailable(Ulid),
    InvalidDateRange(String),
    StayTooShort {
        nights: i64,
        min_nights: u32,
    },
    CapacityExceeded {
        guests: u32,
        capacity: u32,
    },
    /// Carries the id of the blocking booking that was hit first.
    DateConflict(Ulid),
    ExtraUnavailable(Ulid),
    InvalidRequest(String),
    BookingNotFound(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    StorageFailure(String),
}

impl EngineError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            EngineError::PropertyUnavailable(_) => ReasonCode::PropertyUnavailable,
            EngineError::InvalidDateRange(_) => ReasonCode::InvalidDateRange,
            EngineError::StayTooShort { .. } => ReasonCode::StayTooShort,
            EngineError::CapacityExceeded { .. } => ReasonCode::CapacityExceeded,
            EngineError::DateConflict(_) => ReasonCode::DateConflict,
            EngineError::ExtraUnavailable(_) => ReasonCode::ExtraUnavailable,
            EngineError::InvalidRequest(_) => ReasonCode::InvalidRequest,
            EngineError::BookingNotFound(_) => ReasonCode::BookingNotFound,
            EngineError::InvalidTransition { .. } => ReasonCode::InvalidTransition,
            EngineError::StorageFailure(_) => ReasonCode::StorageFailure,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::PropertyUnavailable(id) => {
                write!(f, "property {id} is missing or not accepting bookings")
            }
            EngineError::InvalidDateRange(msg) => write!(f, "invalid date range: {msg}"),
            EngineError::StayTooShort { nights, min_nights } => {
                write!(f, "stay of {nights} nights is below the minimum of {min_nights}")
            }
            EngineError::CapacityExceeded { guests, capacity } => {
                write!(f, "{guests} guests outside allowed range 1..={capacity}")
            }
            EngineError::DateConflict(id) => write!(f, "dates overlap booking {id}"),
            EngineError::ExtraUnavailable(id) => write!(f, "extra {id} is unavailable"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Only I/O-level failures are retryable. A record the store refuses will be refused
/// again, so it is reported as a bad request.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(_) | StoreError::LimitExceeded(_) => {
                EngineError::InvalidRequest(e.to_string())
            }
            StoreError::Io(_) | StoreError::NotFound(_) => EngineError::StorageFailure(e.to_string()),
        }
    }
}

impl From<PricingError> for EngineError {
    fn from(e: PricingError) -> Self {
        EngineError::InvalidRequest(e.to_string())
    }
}

/// Stable, operator-facing rejection code. The wire form is SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    PropertyUnavailable,
    InvalidDateRange,
    StayTooShort,
    CapacityExceeded,
    DateConflict,
    ExtraUnavailable,
    InvalidRequest,
    BookingNotFound,
    InvalidTransition,
    StorageFailure,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PropertyUnavailable => "PROPERTY_UNAVAILABLE",
            ReasonCode::InvalidDateRange => "INVALID_DATE_RANGE",
            ReasonCode::StayTooShort => "STAY_TOO_SHORT",
            ReasonCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ReasonCode::DateConflict => "DATE_CONFLICT",
            ReasonCode::ExtraUnavailable => "EXTRA_UNAVAILABLE",
            ReasonCode::InvalidRequest => "INVALID_REQUEST",
            ReasonCode::BookingNotFound => "BOOKING_NOT_FOUND",
            ReasonCode::InvalidTransition => "INVALID_TRANSITION",
            ReasonCode::StorageFailure => "STORAGE_FAILURE",
        }
    }

    /// Message safe to show a guest. Never contains the code itself.
    pub fn human_message(self) -> &'static str {
        match self {
            ReasonCode::PropertyUnavailable => "This property isn't taking reservations right now.",
            ReasonCode::InvalidDateRange => "Please choose a check-out date after your check-in date.",
            ReasonCode::StayTooShort => "This property requires a longer stay for those dates.",
            ReasonCode::CapacityExceeded => "The number of guests doesn't fit this property.",
            ReasonCode::DateConflict => "Those dates are no longer available.",
            ReasonCode::ExtraUnavailable => "One of the selected add-ons can't be offered for this stay.",
            ReasonCode::InvalidRequest => "Something about this request wasn't quite right. Please review it and try again.",
            ReasonCode::BookingNotFound => "We couldn't find that reservation.",
            ReasonCode::InvalidTransition => "That change isn't possible for this reservation anymore.",
            ReasonCode::StorageFailure => "We couldn't complete your reservation just now. Please try again shortly.",
        }
    }

    /// Only infrastructure failures are worth retrying, and only with an idempotency key.
    pub fn is_retryable(self) -> bool {
        matches!(self, ReasonCode::StorageFailure)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
