//! Hard limits. Anything above these is rejected before touching state.

/// Longest stay accepted in one booking.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Extra line items per booking request.
pub const MAX_EXTRAS_PER_BOOKING: usize = 32;

/// Quantity ceiling for a single extra line.
pub const MAX_EXTRA_QUANTITY: u32 = 100;

/// Free-text guest message length, in bytes.
pub const MAX_GUEST_MESSAGE_LEN: usize = 2_000;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Property / extra display names.
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_PRICE_UNIT_LEN: usize = 64;

/// Bookings kept in one property ledger (all statuses).
pub const MAX_BOOKINGS_PER_PROPERTY: usize = 100_000;

/// Availability queries wider than this are refused.
pub const MAX_AVAILABILITY_WINDOW_DAYS: i64 = 2 * 366;

/// Max bytes per JSON line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
