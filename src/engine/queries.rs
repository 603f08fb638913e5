use ulid::Ulid;

use crate::limits::MAX_AVAILABILITY_WINDOW_DAYS;
use crate::model::*;
use crate::pricing::Quote;
use crate::store::ReservationStore;

use super::availability::{first_conflict, free_ranges};
use super::mutations::log_rejection;
use super::validation::{preflight, resolve_extras};
use super::{BookingEngine, BookingRequest, EngineError};

impl<S: ReservationStore> BookingEngine<S> {
    /// Run the full validation order and price the stay without reserving anything.
    /// A later `create_booking` re-checks everything and may still reject.
    pub async fn quote(&self, req: &BookingRequest) -> Result<Quote, EngineError> {
        let result = self.quote_inner(req).await;
        if let Err(e) = &result {
            log_rejection("quote", e);
        }
        result
    }

    async fn quote_inner(&self, req: &BookingRequest) -> Result<Quote, EngineError> {
        req.check_shape()?;
        let (property, stay) = preflight(self.catalog.as_ref(), req).await?;
        let blocking = self.store.blocking_bookings(property.id, &stay).await?;
        if let Some(conflict) = first_conflict(&blocking, &stay) {
            return Err(EngineError::DateConflict(conflict));
        }
        let charges = resolve_extras(self.catalog.as_ref(), &req.extras, &stay).await?;
        Ok(self.pricing.price(&property, &stay, &charges, Ulid::nil())?)
    }

    /// Free nights of an active property inside `window`, as disjoint half-open ranges.
    pub async fn availability(
        &self,
        property_id: Ulid,
        window: StayRange,
    ) -> Result<Vec<StayRange>, EngineError> {
        if window.nights() > MAX_AVAILABILITY_WINDOW_DAYS {
            return Err(EngineError::InvalidDateRange(format!(
                "availability window limited to {MAX_AVAILABILITY_WINDOW_DAYS} days"
            )));
        }
        self.catalog
            .get_active_property(property_id)
            .await?
            .ok_or(EngineError::PropertyUnavailable(property_id))?;
        let blocking = self.store.blocking_bookings(property_id, &window).await?;
        Ok(free_ranges(&window, &blocking))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingRecord, EngineError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// All bookings of a property in check-in order, whatever their status.
    pub async fn list_bookings(&self, property_id: Ulid) -> Result<Vec<BookingRecord>, EngineError> {
        if self.catalog.get_property(property_id).await?.is_none() {
            return Err(EngineError::PropertyUnavailable(property_id));
        }
        Ok(self.store.list_bookings(property_id).await?)
    }
}
