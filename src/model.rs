use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[check_in, check_out)`. Each date in the range is one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check-out must be after check-in");
        Self {
            check_in,
            check_out,
        }
    }

    /// `None` unless check-out is strictly after check-in.
    pub fn checked(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_out > check_in).then_some(Self {
            check_in,
            check_out,
        })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// True if the night starting on `date` belongs to this stay.
    pub fn contains_night(&self, date: NaiveDate) -> bool {
        self.check_in <= date && date < self.check_out
    }

    /// Every night of the stay, in order.
    pub fn nights_iter(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d < end)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyStatus {
    Draft,
    Pending,
    Active,
    Paused,
    Archived,
}

/// A rentable unit. Read-only from the booking engine's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    /// Max guests.
    pub capacity: u32,
    pub min_nights: u32,
    pub low_season_rate: Decimal,
    pub high_season_rate: Decimal,
    /// Flat, charged once per stay.
    pub cleaning_fee: Decimal,
    pub status: PropertyStatus,
}

impl Property {
    pub fn accepts_bookings(&self) -> bool {
        self.status == PropertyStatus::Active
    }
}

/// Optional paid add-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub id: Ulid,
    pub name: String,
    pub price: Decimal,
    /// Informational label ("per person", "per stay", ...).
    pub price_unit: String,
    pub available: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl BookingStatus {
    /// Statuses that occupy the calendar. Creation and status updates both use this set.
    pub const BLOCKING: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::CheckedIn,
    ];

    pub fn is_blocking(self) -> bool {
        Self::BLOCKING.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::CheckedOut | BookingStatus::Cancelled)
    }

    /// PENDING → CONFIRMED → CHECKED_IN → CHECKED_OUT, with CANCELLED reachable
    /// from PENDING and CONFIRMED.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, CheckedIn)
                | (CheckedIn, CheckedOut)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::CheckedIn => "CHECKED_IN",
            BookingStatus::CheckedOut => "CHECKED_OUT",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment has its own lifecycle; booking creation only ever sets `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Failed,
}

/// Price snapshot taken at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub price_per_night: Decimal,
    pub accommodation_subtotal: Decimal,
    pub cleaning_fee: Decimal,
    pub extras_subtotal: Decimal,
    pub total_amount: Decimal,
}

impl PriceBreakdown {
    pub fn is_reconciled(&self) -> bool {
        self.accommodation_subtotal + self.cleaning_fee + self.extras_subtotal == self.total_amount
    }
}

/// One extra bound to one booking, priced at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingExtra {
    pub booking_id: Ulid,
    pub extra_id: Ulid,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub service_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub stay: StayRange,
    pub nights: u32,
    pub guest_count: u32,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub price: PriceBreakdown,
    pub guest_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A booking together with its extra lines. Always written and read as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub booking: Booking,
    pub extras: Vec<BookingExtra>,
}

/// Per-property booking ledger. The write lock around it is the creation transaction.
#[derive(Debug, Clone)]
pub struct PropertyLedger {
    pub property_id: Ulid,
    /// Bookings of every status, sorted by `stay.check_in`.
    pub bookings: Vec<BookingRecord>,
    idempotency: HashMap<String, Ulid>,
}

impl PropertyLedger {
    pub fn new(property_id: Ulid) -> Self {
        Self {
            property_id,
            bookings: Vec::new(),
            idempotency: HashMap::new(),
        }
    }

    /// Insert keeping check-in order.
    pub fn insert(&mut self, record: BookingRecord) {
        if let Some(key) = &record.booking.idempotency_key {
            self.idempotency.insert(key.clone(), record.booking.id);
        }
        let pos = self
            .bookings
            .binary_search_by_key(&record.booking.stay.check_in, |r| r.booking.stay.check_in)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, record);
    }

    pub fn get(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|r| r.booking.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|r| r.booking.id == id)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Option<&BookingRecord> {
        self.idempotency.get(key).and_then(|id| self.get(*id))
    }

    /// Bookings (any status) whose stay overlaps `query`.
    /// Binary search skips everything checking in on or after `query.check_out`.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &BookingRecord> {
        let right_bound = self
            .bookings
            .partition_point(|r| r.booking.stay.check_in < query.check_out);
        self.bookings[..right_bound]
            .iter()
            .filter(move |r| r.booking.stay.check_out > query.check_in)
    }
}

/// WAL record format. One record per committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyUpserted {
        property: Property,
    },
    ExtraUpserted {
        extra: Extra,
    },
    /// Booking and all its extra lines, committed together.
    BookingCreated {
        record: BookingRecord,
    },
    BookingStatusChanged {
        id: Ulid,
        property_id: Ulid,
        status: BookingStatus,
    },
}
