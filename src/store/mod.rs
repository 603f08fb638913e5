//! Storage interfaces consumed by the booking engine, plus the WAL-backed
//! [`LedgerStore`] implementation.

mod ledger;

pub use ledger::{LedgerStore, LedgerTxn};

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// WAL / disk / task failure. The only kind worth retrying.
    Io(String),
    NotFound(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::Invalid(msg) => write!(f, "invalid record: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Read-only view of properties and extras.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_property(&self, id: Ulid) -> Result<Option<Property>, StoreError>;

    /// `None` for missing properties and for any status other than ACTIVE.
    async fn get_active_property(&self, id: Ulid) -> Result<Option<Property>, StoreError> {
        Ok(self.get_property(id).await?.filter(Property::accepts_bookings))
    }

    /// Extras that exist and are flagged available. Others are silently omitted.
    async fn get_available_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, StoreError>;
}

/// Durable booking storage.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    type Txn: BookingTxn;

    /// Open an exclusive transaction on one property's bookings. Holding the
    /// returned txn keeps every other writer on that property out.
    async fn begin(&self, property_id: Ulid) -> Result<Self::Txn, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError>;

    async fn list_bookings(&self, property_id: Ulid) -> Result<Vec<BookingRecord>, StoreError>;

    /// Point-in-time read of blocking bookings overlapping `window`. Not a
    /// reservation: anything that writes must re-check inside [`BookingTxn`].
    async fn blocking_bookings(
        &self,
        property_id: Ulid,
        window: &StayRange,
    ) -> Result<Vec<Booking>, StoreError>;
}

/// A transaction scope on one property. Dropping it without committing writes nothing.
#[async_trait]
pub trait BookingTxn: Send + Sync + 'static {
    fn property_id(&self) -> Ulid;

    async fn find_blocking_bookings(&self, stay: &StayRange) -> Result<Vec<Booking>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str)
    -> Result<Option<BookingRecord>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError>;

    /// Persist the booking and all its extra lines as one unit, then release the txn.
    async fn create_booking_atomic(self, record: BookingRecord)
    -> Result<BookingRecord, StoreError>;

    async fn update_status(
        self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRecord, StoreError>;
}
