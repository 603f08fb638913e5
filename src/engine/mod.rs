mod availability;
mod error;
mod mutations;
mod queries;
mod request;
mod validation;

pub use availability::{first_conflict, free_ranges, merge_overlapping, subtract_ranges};
pub use error::{EngineError, ReasonCode};
pub use request::{BookingRequest, DateInput, ExtraRequest};

use std::sync::Arc;

use crate::pricing::PricingPolicy;
use crate::store::{Catalog, LedgerStore, ReservationStore};

/// Booking orchestrator. Holds no booking state of its own: every decision is made
/// against the catalog snapshot and a transaction opened on the reservation store.
pub struct BookingEngine<S> {
    catalog: Arc<dyn Catalog>,
    store: Arc<S>,
    pricing: PricingPolicy,
}

impl<S: ReservationStore> BookingEngine<S> {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<S>, pricing: PricingPolicy) -> Self {
        Self {
            catalog,
            store,
            pricing,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn pricing(&self) -> &PricingPolicy {
        &self.pricing
    }
}

impl BookingEngine<LedgerStore> {
    /// Engine whose catalog and reservations both live in one ledger store.
    pub fn with_ledger(store: Arc<LedgerStore>, pricing: PricingPolicy) -> Self {
        Self::new(store.clone(), store, pricing)
    }
}
