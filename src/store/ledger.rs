use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::{BookingTxn, Catalog, ReservationStore, StoreError};

pub type SharedLedger = Arc<RwLock<PropertyLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(Control),
}

enum Control {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(WalCommand::Control(control)) => {
                            // Appends queued before the control command go first.
                            deferred = Some(control);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(control) = deferred {
                    handle_control(&mut wal, control);
                }
            }
            WalCommand::Control(control) => handle_control(&mut wal, control),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_control(wal: &mut Wal, control: Control) {
    match control {
        Control::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        Control::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

#[derive(Clone)]
struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(StoreError::from)
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Control(Control::Compact {
                events,
                response: tx,
            }))
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(StoreError::from)
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Control(Control::AppendsSinceCompact { response: tx });
        if self.tx.send(cmd).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Apply a booking event to its ledger (caller holds the lock).
fn apply_to_ledger(ledger: &mut PropertyLedger, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated { record } => {
            index.insert(record.booking.id, record.booking.property_id);
            ledger.insert(record.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(record) = ledger.get_mut(*id) {
                record.booking.status = *status;
            }
        }
        // Catalog events are applied at the map level, not here
        Event::PropertyUpserted { .. } | Event::ExtraUpserted { .. } => {}
    }
}

/// Property whose ledger a booking event belongs to.
fn event_property_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { record } => Some(record.booking.property_id),
        Event::BookingStatusChanged { property_id, .. } => Some(*property_id),
        Event::PropertyUpserted { .. } | Event::ExtraUpserted { .. } => None,
    }
}

fn validate_property(p: &Property) -> Result<(), StoreError> {
    if p.capacity < 1 {
        return Err(StoreError::Invalid("capacity must be at least 1"));
    }
    if p.min_nights < 1 {
        return Err(StoreError::Invalid("minimum nights must be at least 1"));
    }
    if p.low_season_rate <= rust_decimal::Decimal::ZERO
        || p.high_season_rate <= rust_decimal::Decimal::ZERO
    {
        return Err(StoreError::Invalid("nightly rates must be positive"));
    }
    if p.cleaning_fee.is_sign_negative() {
        return Err(StoreError::Invalid("cleaning fee cannot be negative"));
    }
    if p.name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("property name too long"));
    }
    Ok(())
}

fn validate_extra(e: &Extra) -> Result<(), StoreError> {
    if e.price <= rust_decimal::Decimal::ZERO {
        return Err(StoreError::Invalid("extra price must be positive"));
    }
    if e.name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("extra name too long"));
    }
    if e.price_unit.len() > MAX_PRICE_UNIT_LEN {
        return Err(StoreError::LimitExceeded("price unit too long"));
    }
    Ok(())
}

/// In-memory catalog and booking ledgers, made durable by a group-commit WAL.
///
/// Each property's ledger sits behind its own async `RwLock`; a [`LedgerTxn`] owns the
/// write half, which serializes check-then-write per property within this process.
pub struct LedgerStore {
    properties: DashMap<Ulid, Property>,
    extras: DashMap<Ulid, Extra>,
    ledgers: DashMap<Ulid, SharedLedger>,
    /// booking id → property id
    booking_index: Arc<DashMap<Ulid, Ulid>>,
    /// Serializes catalog writes with compaction.
    catalog_lock: Mutex<()>,
    wal: Option<WalHandle>,
    notify: Arc<NotifyHub>,
}

impl LedgerStore {
    /// Replay `wal_path` (if it exists) and start the background WAL writer.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));

        let store = Self::empty(Some(WalHandle { tx }));
        store.replay(&events);
        info!(
            "ledger store opened: {} events replayed, {} properties, {} bookings",
            events.len(),
            store.properties.len(),
            store.booking_index.len()
        );
        Ok(store)
    }

    /// Same semantics, no durability.
    pub fn in_memory() -> Self {
        Self::empty(None)
    }

    fn empty(wal: Option<WalHandle>) -> Self {
        Self {
            properties: DashMap::new(),
            extras: DashMap::new(),
            ledgers: DashMap::new(),
            booking_index: Arc::new(DashMap::new()),
            catalog_lock: Mutex::new(()),
            wal,
            notify: Arc::new(NotifyHub::new()),
        }
    }

    // Ledgers are plain values until replay finishes, so no locking is needed here.
    fn replay(&self, events: &[Event]) {
        let mut ledgers: HashMap<Ulid, PropertyLedger> = HashMap::new();
        for event in events {
            match event {
                Event::PropertyUpserted { property } => {
                    ledgers
                        .entry(property.id)
                        .or_insert_with(|| PropertyLedger::new(property.id));
                    self.properties.insert(property.id, property.clone());
                }
                Event::ExtraUpserted { extra } => {
                    self.extras.insert(extra.id, extra.clone());
                }
                other => {
                    if let Some(pid) = event_property_id(other)
                        && let Some(ledger) = ledgers.get_mut(&pid)
                    {
                        apply_to_ledger(ledger, other, &self.booking_index);
                    }
                }
            }
        }
        for (id, ledger) in ledgers {
            self.ledgers.insert(id, Arc::new(RwLock::new(ledger)));
        }
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        match &self.wal {
            Some(wal) => wal.append(event).await,
            None => Ok(()),
        }
    }

    // ── Catalog administration ───────────────────────────────

    /// Create or replace a property. Waits for in-flight bookings on it to commit.
    pub async fn upsert_property(&self, property: Property) -> Result<(), StoreError> {
        validate_property(&property)?;
        let _catalog = self.catalog_lock.lock().await;
        let ledger = self
            .ledgers
            .entry(property.id)
            .or_insert_with(|| Arc::new(RwLock::new(PropertyLedger::new(property.id))))
            .clone();
        let _ledger = ledger.write().await;

        let event = Event::PropertyUpserted {
            property: property.clone(),
        };
        self.wal_append(&event).await?;
        let id = property.id;
        self.properties.insert(id, property);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn upsert_extra(&self, extra: Extra) -> Result<(), StoreError> {
        validate_extra(&extra)?;
        let _catalog = self.catalog_lock.lock().await;
        let event = Event::ExtraUpserted {
            extra: extra.clone(),
        };
        self.wal_append(&event).await?;
        self.extras.insert(extra.id, extra);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    /// Bookings are re-emitted with their current status, so status history collapses.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let _catalog = self.catalog_lock.lock().await;

        let mut events: Vec<Event> = Vec::new();
        for entry in self.properties.iter() {
            events.push(Event::PropertyUpserted {
                property: entry.value().clone(),
            });
        }
        for entry in self.extras.iter() {
            events.push(Event::ExtraUpserted {
                extra: entry.value().clone(),
            });
        }

        // Hold every ledger's read lock until the swap so no booking slips between
        // the snapshot and the rewrite.
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(ledgers.len());
        for ledger in ledgers {
            guards.push(ledger.read_owned().await);
        }
        for guard in &guards {
            for record in &guard.bookings {
                events.push(Event::BookingCreated {
                    record: record.clone(),
                });
            }
        }

        let count = events.len();
        wal.compact(events).await?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        match &self.wal {
            Some(wal) => wal.appends_since_compact().await,
            None => 0,
        }
    }

    fn ledger(&self, property_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(property_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl Catalog for LedgerStore {
    async fn get_property(&self, id: Ulid) -> Result<Option<Property>, StoreError> {
        Ok(self.properties.get(&id).map(|e| e.value().clone()))
    }

    async fn get_available_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.extras.get(id))
            .filter(|e| e.available)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[async_trait]
impl ReservationStore for LedgerStore {
    type Txn = LedgerTxn;

    async fn begin(&self, property_id: Ulid) -> Result<LedgerTxn, StoreError> {
        let ledger = self
            .ledger(&property_id)
            .ok_or(StoreError::NotFound(property_id))?;
        let guard = ledger.write_owned().await;
        Ok(LedgerTxn {
            guard,
            wal: self.wal.clone(),
            notify: self.notify.clone(),
            index: self.booking_index.clone(),
        })
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError> {
        let Some(property_id) = self.booking_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.ledger(&property_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn list_bookings(&self, property_id: Ulid) -> Result<Vec<BookingRecord>, StoreError> {
        let Some(ledger) = self.ledger(&property_id) else {
            return Ok(vec![]);
        };
        let guard = ledger.read().await;
        Ok(guard.bookings.clone())
    }

    async fn blocking_bookings(
        &self,
        property_id: Ulid,
        window: &StayRange,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(ledger) = self.ledger(&property_id) else {
            return Ok(vec![]);
        };
        let guard = ledger.read().await;
        Ok(blocking_in(&guard, window))
    }
}

fn blocking_in(ledger: &PropertyLedger, window: &StayRange) -> Vec<Booking> {
    ledger
        .overlapping(window)
        .filter(|r| r.booking.status.is_blocking())
        .map(|r| r.booking.clone())
        .collect()
}

/// Exclusive write scope on one property's ledger.
pub struct LedgerTxn {
    guard: OwnedRwLockWriteGuard<PropertyLedger>,
    wal: Option<WalHandle>,
    notify: Arc<NotifyHub>,
    index: Arc<DashMap<Ulid, Ulid>>,
}

impl LedgerTxn {
    /// WAL-append + apply + notify on a task that owns the write lock. Once started, a
    /// dropped caller can't interrupt it: the record either lands in WAL and memory, or
    /// (on WAL failure) in neither.
    async fn commit(self, event: Event) -> Result<(), StoreError> {
        let LedgerTxn {
            mut guard,
            wal,
            notify,
            index,
        } = self;
        let task = tokio::spawn(async move {
            if let Some(wal) = &wal {
                wal.append(&event).await?;
            }
            apply_to_ledger(&mut guard, &event, &index);
            notify.send(guard.property_id, &event);
            Ok::<(), StoreError>(())
        });
        task.await
            .map_err(|e| StoreError::Io(format!("commit task failed: {e}")))?
    }
}

#[async_trait]
impl BookingTxn for LedgerTxn {
    fn property_id(&self) -> Ulid {
        self.guard.property_id
    }

    async fn find_blocking_bookings(&self, stay: &StayRange) -> Result<Vec<Booking>, StoreError> {
        Ok(blocking_in(&self.guard, stay))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self.guard.find_by_idempotency_key(key).cloned())
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self.guard.get(id).cloned())
    }

    async fn create_booking_atomic(
        self,
        record: BookingRecord,
    ) -> Result<BookingRecord, StoreError> {
        if record.booking.property_id != self.guard.property_id {
            return Err(StoreError::Invalid("booking belongs to another property"));
        }
        if record.extras.iter().any(|l| l.booking_id != record.booking.id) {
            return Err(StoreError::Invalid("extra line bound to another booking"));
        }
        if self.guard.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(StoreError::LimitExceeded("too many bookings on property"));
        }
        let event = Event::BookingCreated {
            record: record.clone(),
        };
        self.commit(event).await?;
        Ok(record)
    }

    async fn update_status(
        self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRecord, StoreError> {
        let mut record = self.guard.get(id).cloned().ok_or(StoreError::NotFound(id))?;
        let event = Event::BookingStatusChanged {
            id,
            property_id: self.guard.property_id,
            status,
        };
        self.commit(event).await?;
        record.booking.status = status;
        Ok(record)
    }
}
