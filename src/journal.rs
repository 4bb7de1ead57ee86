use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame layout: `[u32 le: payload len][bincode: Event][u32 le: crc32 of payload]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely, or report a clean end of stream.
/// A partially read frame counts as end of stream (torn write).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only event journal. All engine state is rebuilt from it.
///
/// A torn or corrupt tail (crash mid-append) ends replay; everything
/// before it is kept.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one event. Nothing is durable until `sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.sync()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("journal.tmp")
    }

    /// Write a minimal event set next to the journal. Slow; runs
    /// before `install_snapshot`.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the journal and reopen for appends.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact event on disk, in append order. A missing file is empty.
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
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorbook_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn sample_events() -> Vec<Event> {
        let tutor = Ulid::new();
        vec![
            Event::LocationAdded {
                location: Location {
                    id: Ulid::new(),
                    name: "Library 2F".into(),
                    modality: Modality::InPerson,
                    join_link: None,
                },
            },
            Event::WindowAdded {
                window: AvailabilityWindow {
                    id: Ulid::new(),
                    tutor_id: tutor,
                    day: chrono::Weekday::Mon,
                    start: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end: chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                    active: true,
                },
            },
            Event::BookingStatusChanged {
                id: Ulid::new(),
                tutor_id: tutor,
                status: BookingStatus::Confirmed,
            },
        ]
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let events = sample_events();
        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append(e).unwrap();
            }
            assert_eq!(journal.appends_since_compact(), 3);
        }
        assert_eq!(Journal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.journal");
        let events = sample_events();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&events[0]).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), vec![events[0].clone()]);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.journal");
        let events = sample_events();
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&events[0]).unwrap();
        }
        {
            let payload = bincode::serialize(&events[1]).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.journal");
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn snapshot_replaces_history() {
        let path = tmp_path("snapshot.journal");
        let events = sample_events();
        let mut journal = Journal::open(&path).unwrap();
        for e in &events {
            journal.append(e).unwrap();
        }

        Journal::write_snapshot(&path, &events[..1]).unwrap();
        journal.install_snapshot().unwrap();
        assert_eq!(journal.appends_since_compact(), 0);

        journal.append(&events[2]).unwrap();
        let replayed = Journal::replay(&path).unwrap();
        assert_eq!(replayed, vec![events[0].clone(), events[2].clone()]);
    }
}
