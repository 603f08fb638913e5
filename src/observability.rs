use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Command;

// ── Request metrics ──────────────────────────────────────────

/// Counter: wire requests handled. Labels: op, status ("ok" or reason code).
pub const REQUESTS_TOTAL: &str = "staybook_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "staybook_request_duration_seconds";

// ── Booking engine ───────────────────────────────────────────

/// Counter: bookings committed (idempotent replays not included).
pub const BOOKINGS_CREATED_TOTAL: &str = "staybook_bookings_created_total";

/// Counter: create/quote rejections. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "staybook_booking_rejections_total";

/// Histogram: time spent holding the property transaction during creation.
pub const BOOKING_TXN_DURATION_SECONDS: &str = "staybook_booking_txn_duration_seconds";

/// Counter: status transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "staybook_status_transitions_total";

// ── Connections ──────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "staybook_connections_active";

pub const CONNECTIONS_TOTAL: &str = "staybook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staybook_connections_rejected_total";

// ── WAL ──────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staybook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "staybook_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "staybook_wal_compactions_total";

/// Install the Prometheus exporter. `None` leaves metrics as no-ops.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short op label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBooking(_) => "create_booking",
        Command::Quote(_) => "quote",
        Command::GetBooking { .. } => "get_booking",
        Command::ListBookings { .. } => "list_bookings",
        Command::Availability { .. } => "availability",
        Command::UpdateStatus { .. } => "update_status",
        Command::UpsertProperty(_) => "upsert_property",
        Command::UpsertExtra(_) => "upsert_extra",
        Command::Watch { .. } => "watch",
        Command::Ping => "ping",
    }
}
