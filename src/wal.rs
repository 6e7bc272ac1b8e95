use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one record as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read a little-endian u32. `Ok(None)` on a clean or torn end of file.
fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decode the next record. `Ok(None)` once the log ends or turns unreadable.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let Some(len) = read_u32(reader)? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let Some(stored_crc) = read_u32(reader)? else {
        return Ok(None);
    };
    if stored_crc != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only log of committed events, one file per tenant.
///
/// Record layout: `[u32 len][bincode Event][u32 crc32]`, little-endian, where
/// `len` counts only the payload. A torn or corrupt tail (crash mid-write) ends
/// replay at the last intact record.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
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

    /// Every intact record, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_record(&mut reader)? {
            events.push(event);
        }
        if events.is_empty() && total > 0 {
            tracing::warn!(path = %path.display(), "WAL has no intact records");
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("freqd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn band_created(name: &str) -> Event {
        Event::BandCreated {
            band: Band {
                id: Ulid::new(),
                name: name.into(),
                from: 144_000_000,
                to: 146_000_000,
                spacing: 12_500,
            },
        }
    }

    fn committed(values: &[Hz]) -> Event {
        let holder = Holder::new("user_1", "op@example.org", Location::new(51.5, -0.12));
        let occupied: Vec<OccupancyRecord> = values.iter().map(|v| holder.occupancy(*v, 1)).collect();
        Event::LedgerCommitted {
            delta: LedgerDelta {
                released: vec![],
                history: occupied.iter().map(HistoryRecord::from).collect(),
                occupied,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let events = vec![band_created("2m"), committed(&[144_000_000, 144_012_500])];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let _ = fs::remove_file(&path);

        let event = band_created("2m");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // length prefix promising more bytes than follow
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        let good = committed(&[145_000_000]);
        let bad = Event::BandDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        let band = band_created("70cm");
        let survivor = committed(&[145_500_000]);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&band).unwrap();
            for i in 0..20 {
                let v = 144_000_000 + i * 12_500;
                wal.append(&committed(&[v])).unwrap();
                wal.append(&Event::LedgerCommitted {
                    delta: LedgerDelta {
                        released: vec![v],
                        ..Default::default()
                    },
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let after_event = committed(&[145_600_000]);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[band.clone(), survivor.clone()]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&after_event).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![band, survivor, after_event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|i| band_created(&format!("b{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}
