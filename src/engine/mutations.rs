use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    BOOKINGS_CREATED_TOTAL, BOOKING_REJECTIONS_TOTAL, BOOKING_TXN_DURATION_SECONDS,
    STATUS_TRANSITIONS_TOTAL,
};
use crate::store::{BookingTxn, ReservationStore};

use super::availability::first_conflict;
use super::validation::{preflight, resolve_extras};
use super::{BookingEngine, BookingRequest, EngineError};

impl<S: ReservationStore> BookingEngine<S> {
    /// Validate, price and persist a reservation as one atomic unit.
    ///
    /// Validation short-circuits in a fixed order: property, dates, minimum stay, guests,
    /// overlap, extras. Overlap and extras are checked inside the property transaction,
    /// so two overlapping requests can never both commit.
    ///
    /// Dropping the returned future before the commit starts leaves no booking behind.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<BookingRecord, EngineError> {
        let result = self.create_booking_inner(req).await;
        match &result {
            Ok(record) => {
                info!(
                    "booking {} created on property {} for {} ({} nights)",
                    record.booking.id,
                    record.booking.property_id,
                    record.booking.price.total_amount,
                    record.booking.nights
                );
            }
            Err(e) => log_rejection("create_booking", e),
        }
        result
    }

    async fn create_booking_inner(&self, req: BookingRequest) -> Result<BookingRecord, EngineError> {
        req.check_shape()?;
        let (property, stay) = preflight(self.catalog.as_ref(), &req).await?;

        let txn = self.store.begin(property.id).await?;
        let txn_start = Instant::now();

        if let Some(key) = &req.idempotency_key
            && let Some(existing) = txn.find_by_idempotency_key(key).await?
        {
            if !is_same_request(&existing, &req, &stay) {
                return Err(EngineError::InvalidRequest(
                    "idempotency key already used for a different booking".into(),
                ));
            }
            debug!("idempotent replay of booking {} (key {key})", existing.booking.id);
            return Ok(existing);
        }

        let blocking = txn.find_blocking_bookings(&stay).await?;
        if let Some(conflict) = first_conflict(&blocking, &stay) {
            return Err(EngineError::DateConflict(conflict));
        }

        let charges = resolve_extras(self.catalog.as_ref(), &req.extras, &stay).await?;
        let booking_id = Ulid::new();
        let quote = self.pricing.price(&property, &stay, &charges, booking_id)?;

        let record = BookingRecord {
            booking: Booking {
                id: booking_id,
                property_id: property.id,
                guest_id: req.guest_id,
                stay,
                nights: u32::try_from(stay.nights())
                    .map_err(|_| EngineError::InvalidDateRange("stay too long".into()))?,
                guest_count: req.guest_count,
                status: BookingStatus::Pending,
                payment_status: PaymentStatus::Pending,
                price: quote.price,
                guest_message: req.guest_message,
                idempotency_key: req.idempotency_key,
                created_at: Utc::now(),
            },
            extras: quote.lines,
        };

        let committed = txn.create_booking_atomic(record).await?;
        metrics::histogram!(BOOKING_TXN_DURATION_SECONDS).record(txn_start.elapsed().as_secs_f64());
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(committed)
    }

    /// Move a booking along its lifecycle. The current status is re-read under the
    /// property transaction, so concurrent updates serialize.
    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRecord, EngineError> {
        let result = self.update_booking_status_inner(id, status).await;
        match &result {
            Ok(record) => {
                metrics::counter!(STATUS_TRANSITIONS_TOTAL, "to" => status.as_str()).increment(1);
                info!("booking {id} on property {} now {status}", record.booking.property_id);
            }
            Err(e) => log_rejection("update_status", e),
        }
        result
    }

    async fn update_booking_status_inner(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRecord, EngineError> {
        let located = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::BookingNotFound(id))?;

        let txn = self.store.begin(located.booking.property_id).await?;
        let current = txn
            .get_booking(id)
            .await?
            .ok_or(EngineError::BookingNotFound(id))?;
        let from = current.booking.status;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from, to: status });
        }
        // Every allowed move keeps or leaves the blocking set, so no overlap re-check.
        debug_assert!(from.is_blocking() || !status.is_blocking());
        Ok(txn.update_status(id, status).await?)
    }
}

/// True if `req` asks for exactly what `existing` already holds: same guest, stay,
/// party size, message, and the same extra lines in the same order.
fn is_same_request(existing: &BookingRecord, req: &BookingRequest, stay: &StayRange) -> bool {
    let b = &existing.booking;
    if b.guest_id != req.guest_id
        || b.stay != *stay
        || b.guest_count != req.guest_count
        || b.guest_message != req.guest_message
        || existing.extras.len() != req.extras.len()
    {
        return false;
    }
    existing.extras.iter().zip(&req.extras).all(|(line, asked)| {
        let asked_date = match &asked.service_date {
            Some(input) => input.date(),
            None => Some(stay.check_in),
        };
        line.extra_id == asked.extra_id
            && line.quantity == asked.quantity
            && Some(line.service_date) == asked_date
    })
}

pub(super) fn log_rejection(op: &'static str, e: &EngineError) {
    let code = e.reason_code();
    metrics::counter!(BOOKING_REJECTIONS_TOTAL, "reason" => code.as_str()).increment(1);
    if code.is_retryable() {
        warn!("{op} failed ({code}): {e}");
    } else {
        debug!("{op} rejected ({code}): {e}");
    }
}
