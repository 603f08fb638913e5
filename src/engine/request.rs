use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;

use super::EngineError;

/// A calendar date as the client sent it. Text that isn't a `YYYY-MM-DD` date is kept
/// so the engine can reject it at the right point of the validation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateInput {
    Parsed(NaiveDate),
    Unparsed(String),
}

impl DateInput {
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<NaiveDate>() {
            Ok(date) => DateInput::Parsed(date),
            Err(_) => DateInput::Unparsed(s.to_string()),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            DateInput::Parsed(date) => Some(*date),
            DateInput::Unparsed(_) => None,
        }
    }
}

impl From<NaiveDate> for DateInput {
    fn from(date: NaiveDate) -> Self {
        DateInput::Parsed(date)
    }
}

impl std::fmt::Display for DateInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateInput::Parsed(date) => write!(f, "{date}"),
            DateInput::Unparsed(raw) => write!(f, "{raw:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraRequest {
    pub extra_id: Ulid,
    pub quantity: u32,
    /// Defaults to check-in.
    pub service_date: Option<DateInput>,
}

/// A typed reservation request. Ordering, date and stay rules are checked by the
/// engine in its fixed validation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub guest_id: Ulid,
    pub property_id: Ulid,
    pub check_in: DateInput,
    pub check_out: DateInput,
    pub guest_count: u32,
    pub extras: Vec<ExtraRequest>,
    pub guest_message: Option<String>,
    pub idempotency_key: Option<String>,
}

impl BookingRequest {
    pub fn new(
        guest_id: Ulid,
        property_id: Ulid,
        check_in: impl Into<DateInput>,
        check_out: impl Into<DateInput>,
        guest_count: u32,
    ) -> Self {
        Self {
            guest_id,
            property_id,
            check_in: check_in.into(),
            check_out: check_out.into(),
            guest_count,
            extras: Vec::new(),
            guest_message: None,
            idempotency_key: None,
        }
    }

    pub fn with_extra(mut self, extra_id: Ulid, quantity: u32) -> Self {
        self.extras.push(ExtraRequest {
            extra_id,
            quantity,
            service_date: None,
        });
        self
    }

    pub fn with_extra_on(
        mut self,
        extra_id: Ulid,
        quantity: u32,
        date: impl Into<DateInput>,
    ) -> Self {
        self.extras.push(ExtraRequest {
            extra_id,
            quantity,
            service_date: Some(date.into()),
        });
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.guest_message = Some(message.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Structural limits, checked before any domain rule.
    pub(crate) fn check_shape(&self) -> Result<(), EngineError> {
        if self.extras.len() > MAX_EXTRAS_PER_BOOKING {
            return Err(EngineError::InvalidRequest(format!(
                "at most {MAX_EXTRAS_PER_BOOKING} extras per booking"
            )));
        }
        if let Some(line) = self
            .extras
            .iter()
            .find(|l| l.quantity == 0 || l.quantity > MAX_EXTRA_QUANTITY)
        {
            return Err(EngineError::InvalidRequest(format!(
                "extra {} quantity must be 1..={MAX_EXTRA_QUANTITY}",
                line.extra_id
            )));
        }
        if self
            .guest_message
            .as_ref()
            .is_some_and(|m| m.len() > MAX_GUEST_MESSAGE_LEN)
        {
            return Err(EngineError::InvalidRequest("guest message too long".into()));
        }
        match &self.idempotency_key {
            Some(key) if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(
                EngineError::InvalidRequest("idempotency key must be 1..=128 bytes".into()),
            ),
            _ => Ok(()),
        }
    }
}
