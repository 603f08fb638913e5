use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::model::Event;

/// A length prefix above this is treated as garbage rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 le: len][bincode payload][u32 le: crc32(payload)]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(u64::from(len) + 8)
}

/// `Ok(None)` at clean EOF, on a torn tail, or on a frame that fails its checksum.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only event log backing the ledger store.
///
/// A crash mid-append leaves at most one torn frame at the tail; replay stops there.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful sync.
    synced_len: u64,
    /// Bytes handed to the writer since then.
    pending_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            pending_len: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_len;
        self.pending_len = 0;
        Ok(())
    }

    /// Append and sync a group of events as one unit.
    ///
    /// On error the file is cut back to its pre-batch length, so no event of a
    /// failed batch survives into replay.
    pub fn append_batch<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> io::Result<()> {
        let appends = self.appends_since_compact;
        let result = events
            .into_iter()
            .try_for_each(|event| self.append_buffered(event))
            .and_then(|()| self.flush_sync());
        if result.is_err() {
            if let Err(e) = self.rollback(appends) {
                error!(path = %self.path.display(), "WAL rollback failed: {e}");
            }
        }
        result
    }

    /// Drop everything written since the last sync.
    fn rollback(&mut self, appends: u64) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // into_parts hands back the unflushed buffer instead of writing it on drop.
        let (_, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        self.pending_len = 0;
        self.appends_since_compact = appends;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted snapshot next to the live log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.pending_len = 0;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event from the start of the file. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Extra, Property, PropertyStatus};
    use rust_decimal_macros::dec;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staybook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn property_event(name: &str) -> Event {
        Event::PropertyUpserted {
            property: Property {
                id: Ulid::new(),
                owner_id: Ulid::new(),
                name: name.into(),
                capacity: 6,
                min_nights: 3,
                low_season_rate: dec!(4000),
                high_season_rate: dec!(5500),
                cleaning_fee: dec!(500),
                status: PropertyStatus::Active,
            },
        }
    }

    fn status_event(status: BookingStatus) -> Event {
        Event::BookingStatusChanged {
            id: Ulid::new(),
            property_id: Ulid::new(),
            status,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            property_event("Lake house"),
            Event::ExtraUpserted {
                extra: Extra {
                    id: Ulid::new(),
                    name: "Airport pickup".into(),
                    price: dec!(450.50),
                    price_unit: "per trip".into(),
                    available: true,
                },
            },
            status_event(BookingStatus::Confirmed),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let first = property_event("Loft");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            // Length prefix promising more bytes than follow.
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = status_event(BookingStatus::Cancelled);
        let bad = status_event(BookingStatus::CheckedIn);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();

            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xBAD0_C0DEu32.to_le_bytes()).unwrap();
        }
        // Appends after a corrupt frame are unreachable too.
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&status_event(BookingStatus::CheckedOut)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let snapshot = vec![property_event("Chalet")];
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..25 {
                wal.append(&status_event(BookingStatus::Confirmed)).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 25);
        }
        let before = fs::metadata(&path).unwrap().len();

        let mut wal = Wal::open(&path).unwrap();
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "{after} should be below {before}");
        assert_eq!(Wal::replay(&path).unwrap(), snapshot);
        assert!(!Wal::tmp_path(&path).exists());
    }

    #[test]
    fn appends_land_after_compaction() {
        let path = tmp_path("compact_then_append.wal");
        let snapshot = vec![property_event("Studio")];
        let later = status_event(BookingStatus::CheckedOut);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&status_event(BookingStatus::Pending)).unwrap();
            wal.compact(&snapshot).unwrap();
            wal.append(&later).unwrap();
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), later]);
    }

    #[test]
    fn group_commit_buffers_until_sync() {
        let path = tmp_path("group_commit.wal");
        let events: Vec<Event> = (0..4).map(|i| property_event(&format!("unit {i}"))).collect();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 4);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn batch_appends_together() {
        let path = tmp_path("batch.wal");
        let events: Vec<Event> = (0..3).map(|i| property_event(&format!("cabin {i}"))).collect();
        let mut wal = Wal::open(&path).unwrap();
        wal.append_batch(&events).unwrap();
        assert_eq!(wal.appends_since_compact(), 3);
        assert_eq!(wal.synced_len, fs::metadata(&path).unwrap().len());
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_batch_leaves_no_frames_behind() {
        let path = tmp_path("rollback.wal");
        let kept = property_event("Barn");
        let later = status_event(BookingStatus::Confirmed);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let appends = wal.appends_since_compact();

        // Half a batch reached the file before the sync failed.
        wal.append_buffered(&status_event(BookingStatus::Pending)).unwrap();
        wal.append_buffered(&status_event(BookingStatus::Cancelled)).unwrap();
        wal.writer.flush().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 3);

        wal.rollback(appends).unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
    }

    #[test]
    fn reopen_tracks_existing_length() {
        let path = tmp_path("reopen_len.wal");
        let first = property_event("Hut");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&status_event(BookingStatus::Pending)).unwrap();
        wal.writer.flush().unwrap();
        wal.rollback(0).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }
}
