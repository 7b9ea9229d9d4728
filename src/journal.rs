use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only schedule journal — the tenant's source of truth.
///
/// Format per record: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated last record (crash mid-write) is safely discarded on replay
///   via the length prefix + CRC check.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

impl Journal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer a record without flushing or syncing. Call `flush_sync()`
    /// after the batch to durably commit everything buffered — the group
    /// commit writer amortizes one fsync over the whole batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append a single record and fsync. Test convenience — production code
    /// goes through the group-commit writer task.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write compacted records to a temp file and fsync. This is the slow
    /// I/O phase — runs before the swap so the journal stays available.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("journal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomic swap: rename the temp file over the journal and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("journal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay the journal from disk, returning all valid records in order.
    /// Truncated or corrupt trailing records are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break; // corrupt record — stop replaying
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Span, WeekHours};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_event(id: Ulid) -> Event {
        Event::ResourceRegistered {
            id,
            name: Some("Chair 1".into()),
            tz: chrono_tz::UTC,
            hours: WeekHours::weekdays(9 * 60, 17 * 60),
            buffer: 0,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let rid = Ulid::new();
        let events = vec![
            resource_event(rid),
            Event::AppointmentBooked {
                id: Ulid::new(),
                resource_id: rid,
                span: Span::new(1000, 2000),
                series: None,
                label: None,
            },
        ];

        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append(e).unwrap();
            }
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.journal");
        let event = resource_event(Ulid::new());

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&event).unwrap();
        }

        // Append garbage to simulate a record cut off mid-write
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.journal");
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.journal");
        let event = resource_event(Ulid::new());

        {
            let payload = bincode::serialize(&event).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Journal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_journal() {
        let path = tmp_path("compact_reduce.journal");
        let rid = Ulid::new();

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&resource_event(rid)).unwrap();
            // Churn: book + cancel repeatedly
            for _ in 0..10 {
                let aid = Ulid::new();
                journal
                    .append(&Event::AppointmentBooked {
                        id: aid,
                        resource_id: rid,
                        span: Span::new(1000, 2000),
                        series: None,
                        label: None,
                    })
                    .unwrap();
                journal
                    .append(&Event::AppointmentStatusChanged {
                        id: aid,
                        resource_id: rid,
                        status: crate::model::AppointmentStatus::Cancelled,
                    })
                    .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![resource_event(rid)];
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should shrink: {after} < {before}");
        assert_eq!(Journal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.journal");
        let rid = Ulid::new();
        let compacted = vec![resource_event(rid)];
        let new_event = Event::AppointmentBooked {
            id: Ulid::new(),
            resource_id: rid,
            span: Span::new(1000, 2000),
            series: None,
            label: None,
        };

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&compacted[0]).unwrap();
            journal.compact(&compacted).unwrap();
            journal.append(&new_event).unwrap();
        }

        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.journal");
        let events: Vec<Event> = (0..5).map(|_| resource_event(Ulid::new())).collect();

        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append_buffered(e).unwrap();
            }
            assert_eq!(journal.appends_since_compact(), 5);
            journal.flush_sync().unwrap();
        }

        assert_eq!(Journal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}
