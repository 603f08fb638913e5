//! Newline-delimited JSON over TCP.
//!
//! One request object per line, tagged by `"op"`; one reply object per line.
//!
//! ```json
//! {"op":"create_booking","guestId":"01J...","propertyId":"01J...","checkInDate":"2026-03-15",
//!  "checkOutDate":"2026-03-22","guestCount":6,"extras":[{"extraId":"01J...","quantity":2}]}
//! {"ok":true,"bookingId":"01J...","nights":7,"pricePerNight":"5500","totalAmount":"39900",...}
//!
//! {"op":"create_booking", ...overlapping dates...}
//! {"ok":false,"reasonCode":"DATE_CONFLICT","humanMessage":"Those dates are no longer available."}
//! ```
//!
//! Money travels as decimal strings, dates as `YYYY-MM-DD`. After a successful
//! `watch`, the connection only streams committed events for that property.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{BookingEngine, BookingRequest, DateInput, EngineError, ExtraRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{
    self, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL,
    REQUEST_DURATION_SECONDS, REQUESTS_TOTAL,
};
use crate::pricing::Quote;
use crate::store::{Catalog, LedgerStore};

pub type Engine = BookingEngine<LedgerStore>;

type Lines = Framed<TcpStream, LinesCodec>;

// ── Requests ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    CreateBooking(BookingBody),
    Quote(BookingBody),
    GetBooking { booking_id: String },
    ListBookings { property_id: String },
    Availability {
        property_id: String,
        from: String,
        to: String,
    },
    UpdateStatus {
        booking_id: String,
        status: BookingStatus,
    },
    UpsertProperty(PropertyBody),
    UpsertExtra(ExtraBody),
    Watch { property_id: String },
    Ping,
}

/// Ids and dates stay strings here so each parse failure maps onto its own code
/// at its own point of the validation order.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingBody {
    guest_id: String,
    property_id: String,
    check_in_date: String,
    check_out_date: String,
    guest_count: i64,
    #[serde(default)]
    extras: Vec<ExtraLineBody>,
    guest_message: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraLineBody {
    extra_id: String,
    quantity: i64,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyBody {
    id: Ulid,
    owner_id: Ulid,
    name: String,
    capacity: u32,
    min_nights: u32,
    low_season_rate: Decimal,
    high_season_rate: Decimal,
    cleaning_fee: Decimal,
    #[serde(default = "active")]
    status: PropertyStatus,
}

fn active() -> PropertyStatus {
    PropertyStatus::Active
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraBody {
    id: Ulid,
    name: String,
    price: Decimal,
    #[serde(default)]
    price_unit: String,
    #[serde(default = "yes")]
    available: bool,
}

fn yes() -> bool {
    true
}

fn parse_id(s: &str, field: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(s.trim())
        .map_err(|e| EngineError::InvalidRequest(format!("bad {field}: {e}")))
}

fn parse_date(s: &str, field: &str) -> Result<NaiveDate, EngineError> {
    s.trim()
        .parse::<NaiveDate>()
        .map_err(|_| EngineError::InvalidDateRange(format!("{field} {s:?} is not a YYYY-MM-DD date")))
}

/// Out-of-range counts are clamped so the engine reports them with its own codes.
fn clamp_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

impl BookingBody {
    fn into_request(self) -> Result<BookingRequest, EngineError> {
        let guest_id = parse_id(&self.guest_id, "guestId")?;
        let property_id = parse_id(&self.property_id, "propertyId")?;
        let extras = self
            .extras
            .into_iter()
            .map(|line| {
                Ok(ExtraRequest {
                    extra_id: parse_id(&line.extra_id, "extraId")?,
                    quantity: clamp_count(line.quantity),
                    service_date: line.date.as_deref().map(DateInput::parse),
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        // Dates go through unparsed: the engine reports bad ones after the property check.
        let mut req = BookingRequest::new(
            guest_id,
            property_id,
            DateInput::parse(&self.check_in_date),
            DateInput::parse(&self.check_out_date),
            clamp_count(self.guest_count),
        );
        req.extras = extras;
        req.guest_message = self.guest_message;
        req.idempotency_key = self.idempotency_key;
        Ok(req)
    }
}

impl From<PropertyBody> for Property {
    fn from(b: PropertyBody) -> Self {
        Property {
            id: b.id,
            owner_id: b.owner_id,
            name: b.name,
            capacity: b.capacity,
            min_nights: b.min_nights,
            low_season_rate: b.low_season_rate,
            high_season_rate: b.high_season_rate,
            cleaning_fee: b.cleaning_fee,
            status: b.status,
        }
    }
}

impl From<ExtraBody> for Extra {
    fn from(b: ExtraBody) -> Self {
        Extra {
            id: b.id,
            name: b.name,
            price: b.price,
            price_unit: b.price_unit,
            available: b.available,
        }
    }
}

// ── Replies ──────────────────────────────────────────────────

#[derive(Serialize)]
struct Success<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Failure {
    ok: bool,
    reason_code: &'static str,
    human_message: &'static str,
}

impl From<&EngineError> for Failure {
    fn from(e: &EngineError) -> Self {
        let code = e.reason_code();
        Failure {
            ok: false,
            reason_code: code.as_str(),
            human_message: code.human_message(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedExtraView {
    extra_id: Ulid,
    name: String,
    quantity: u32,
    unit_price: Decimal,
    subtotal: Decimal,
    date: NaiveDate,
}

impl From<&BookingExtra> for ResolvedExtraView {
    fn from(l: &BookingExtra) -> Self {
        ResolvedExtraView {
            extra_id: l.extra_id,
            name: l.name.clone(),
            quantity: l.quantity,
            unit_price: l.unit_price,
            subtotal: l.subtotal,
            date: l.service_date,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BookingView {
    booking_id: Ulid,
    property_id: Ulid,
    guest_id: Ulid,
    check_in_date: NaiveDate,
    check_out_date: NaiveDate,
    nights: u32,
    guest_count: u32,
    price_per_night: Decimal,
    accommodation_subtotal: Decimal,
    cleaning_fee: Decimal,
    extras_subtotal: Decimal,
    total_amount: Decimal,
    status: BookingStatus,
    payment_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    guest_message: Option<String>,
    created_at: DateTime<Utc>,
    resolved_extras: Vec<ResolvedExtraView>,
}

impl From<&BookingRecord> for BookingView {
    fn from(r: &BookingRecord) -> Self {
        let b = &r.booking;
        BookingView {
            booking_id: b.id,
            property_id: b.property_id,
            guest_id: b.guest_id,
            check_in_date: b.stay.check_in,
            check_out_date: b.stay.check_out,
            nights: b.nights,
            guest_count: b.guest_count,
            price_per_night: b.price.price_per_night,
            accommodation_subtotal: b.price.accommodation_subtotal,
            cleaning_fee: b.price.cleaning_fee,
            extras_subtotal: b.price.extras_subtotal,
            total_amount: b.price.total_amount,
            status: b.status,
            payment_status: b.payment_status,
            guest_message: b.guest_message.clone(),
            created_at: b.created_at,
            resolved_extras: r.extras.iter().map(ResolvedExtraView::from).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteView {
    check_in_date: NaiveDate,
    check_out_date: NaiveDate,
    nights: i64,
    price_per_night: Decimal,
    accommodation_subtotal: Decimal,
    cleaning_fee: Decimal,
    extras_subtotal: Decimal,
    total_amount: Decimal,
    resolved_extras: Vec<ResolvedExtraView>,
}

impl From<&Quote> for QuoteView {
    fn from(q: &Quote) -> Self {
        QuoteView {
            check_in_date: q.stay.check_in,
            check_out_date: q.stay.check_out,
            nights: q.stay.nights(),
            price_per_night: q.price.price_per_night,
            accommodation_subtotal: q.price.accommodation_subtotal,
            cleaning_fee: q.price.cleaning_fee,
            extras_subtotal: q.price.extras_subtotal,
            total_amount: q.price.total_amount,
            resolved_extras: q.lines.iter().map(ResolvedExtraView::from).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RangeView {
    check_in_date: NaiveDate,
    check_out_date: NaiveDate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityView {
    property_id: Ulid,
    free: Vec<RangeView>,
}

#[derive(Serialize)]
struct BookingsView {
    bookings: Vec<BookingView>,
}

#[derive(Serialize)]
struct IdView {
    id: Ulid,
}

#[derive(Serialize)]
struct PongView {
    pong: bool,
}

#[derive(Serialize)]
struct WatchingView {
    watching: Ulid,
}

/// One line pushed to a watching connection.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum EventView {
    PropertyUpdated {
        property_id: Ulid,
        status: PropertyStatus,
    },
    BookingCreated {
        booking_id: Ulid,
        property_id: Ulid,
        check_in_date: NaiveDate,
        check_out_date: NaiveDate,
        status: BookingStatus,
    },
    BookingStatusChanged {
        booking_id: Ulid,
        property_id: Ulid,
        status: BookingStatus,
    },
}

impl EventView {
    fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::PropertyUpserted { property } => Some(EventView::PropertyUpdated {
                property_id: property.id,
                status: property.status,
            }),
            Event::BookingCreated { record } => Some(EventView::BookingCreated {
                booking_id: record.booking.id,
                property_id: record.booking.property_id,
                check_in_date: record.booking.stay.check_in,
                check_out_date: record.booking.stay.check_out,
                status: record.booking.status,
            }),
            Event::BookingStatusChanged {
                id,
                property_id,
                status,
            } => Some(EventView::BookingStatusChanged {
                booking_id: *id,
                property_id: *property_id,
                status: *status,
            }),
            Event::ExtraUpserted { .. } => None,
        }
    }
}

const ENCODE_FALLBACK: &str =
    r#"{"ok":false,"reasonCode":"STORAGE_FAILURE","humanMessage":"Please try again shortly."}"#;

fn encode(reply: &impl Serialize) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        error!("reply encoding failed: {e}");
        ENCODE_FALLBACK.to_string()
    })
}

fn ok<T: Serialize>(body: T) -> Result<String, EngineError> {
    Ok(encode(&Success { ok: true, body }))
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::other("line too long"),
    }
}

// ── Dispatch ─────────────────────────────────────────────────

async fn execute(engine: &Engine, cmd: Command) -> Result<String, EngineError> {
    match cmd {
        Command::CreateBooking(body) => {
            let rec = engine.create_booking(body.into_request()?).await?;
            ok(BookingView::from(&rec))
        }
        Command::Quote(body) => {
            let quote = engine.quote(&body.into_request()?).await?;
            ok(QuoteView::from(&quote))
        }
        Command::GetBooking { booking_id } => {
            let rec = engine.get_booking(parse_id(&booking_id, "bookingId")?).await?;
            ok(BookingView::from(&rec))
        }
        Command::ListBookings { property_id } => {
            let records = engine
                .list_bookings(parse_id(&property_id, "propertyId")?)
                .await?;
            ok(BookingsView {
                bookings: records.iter().map(BookingView::from).collect(),
            })
        }
        Command::Availability {
            property_id,
            from,
            to,
        } => {
            let property_id = parse_id(&property_id, "propertyId")?;
            let from = parse_date(&from, "from")?;
            let to = parse_date(&to, "to")?;
            let window = StayRange::checked(from, to).ok_or_else(|| {
                EngineError::InvalidDateRange(format!("window {from}..{to} is empty"))
            })?;
            let free = engine.availability(property_id, window).await?;
            ok(AvailabilityView {
                property_id,
                free: free
                    .into_iter()
                    .map(|r| RangeView {
                        check_in_date: r.check_in,
                        check_out_date: r.check_out,
                    })
                    .collect(),
            })
        }
        Command::UpdateStatus { booking_id, status } => {
            let rec = engine
                .update_booking_status(parse_id(&booking_id, "bookingId")?, status)
                .await?;
            ok(BookingView::from(&rec))
        }
        Command::UpsertProperty(body) => {
            let property = Property::from(body);
            let id = property.id;
            engine.store().upsert_property(property).await?;
            ok(IdView { id })
        }
        Command::UpsertExtra(body) => {
            let extra = Extra::from(body);
            let id = extra.id;
            engine.store().upsert_extra(extra).await?;
            ok(IdView { id })
        }
        Command::Ping => ok(PongView { pong: true }),
        // Handled by the connection loop: it takes over the socket.
        Command::Watch { .. } => Err(EngineError::InvalidRequest("watch not allowed here".into())),
    }
}

async fn watch_target(engine: &Engine, property_id: &str) -> Result<Ulid, EngineError> {
    let id = parse_id(property_id, "propertyId")?;
    engine
        .store()
        .get_property(id)
        .await?
        .ok_or(EngineError::PropertyUnavailable(id))?;
    Ok(id)
}

/// Stream committed events for one property until the client hangs up.
async fn watch(mut framed: Lines, store: &LedgerStore, property_id: Ulid) -> io::Result<()> {
    let mut rx = store.notify().subscribe(property_id);
    framed
        .send(encode(&Success {
            ok: true,
            body: WatchingView {
                watching: property_id,
            },
        }))
        .await
        .map_err(codec_err)?;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if let Some(view) = EventView::from_event(&event) {
                        framed.send(encode(&view)).await.map_err(codec_err)?;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("watcher on {property_id} lagged, {n} events dropped"),
                Err(RecvError::Closed) => return Ok(()),
            },
            line = framed.next() => match line {
                None => return Ok(()),
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
                // Input is ignored while watching.
                Some(_) => {}
            },
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let err = EngineError::InvalidRequest("line too long".into());
                framed.send(encode(&Failure::from(&err))).await.map_err(codec_err)?;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }

        let started = Instant::now();
        let (label, result) = match serde_json::from_str::<Command>(&line) {
            Err(e) => (
                "invalid",
                Err(EngineError::InvalidRequest(format!("malformed request: {e}"))),
            ),
            Ok(Command::Watch { property_id }) => match watch_target(&engine, &property_id).await {
                Ok(id) => {
                    debug!("connection now watching property {id}");
                    return watch(framed, engine.store(), id).await;
                }
                Err(e) => ("watch", Err(e)),
            },
            Ok(cmd) => {
                let label = observability::command_label(&cmd);
                (label, execute(&engine, cmd).await)
            }
        };

        let (status, reply) = match result {
            Ok(reply) => ("ok", reply),
            Err(e) => (e.reason_code().as_str(), encode(&Failure::from(&e))),
        };
        metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => label)
            .record(started.elapsed().as_secs_f64());

        framed.send(reply).await.map_err(codec_err)?;
    }
    Ok(())
}

/// Accept loop. Returns once `shutdown` resolves; in-flight connections keep their
/// permits until they finish, so callers can drain on the semaphore.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    connections: Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = connections.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = process_connection(socket, engine).await {
                        warn!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                return;
            }
        }
    }
}
