//! Write-Ahead Log (WAL) for head durability
//!
//! Every record applied to a head is persisted here first. On restart,
//! recovery replays the segments of any WAL that was not yet built.
//!
//! A WAL is a directory of sequentially numbered segment files
//! (`00000000`, `00000001`, ...). A writer opening an existing directory
//! always starts a new segment after the highest one present.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (encoded WalRecord)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{HeadError, HeadResult};
use crate::storage::record::WalRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Largest payload a well-formed envelope may declare
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Default size at which the writer rolls to a new segment
pub const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

const ENVELOPE_OVERHEAD: usize = 8;

/// Sync strategy for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalSyncMode {
    /// Fsync after every write (safest, slowest)
    EveryWrite,
    /// Fsync in batches (balanced)
    #[default]
    Batched,
    /// No fsync, rely on OS (fastest, risk of loss)
    None,
}

impl std::str::FromStr for WalSyncMode {
    type Err = HeadError;

    fn from_str(s: &str) -> HeadResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "every_write" | "everywrite" | "always" => Ok(WalSyncMode::EveryWrite),
            "batched" | "batch" => Ok(WalSyncMode::Batched),
            "none" | "never" => Ok(WalSyncMode::None),
            other => Err(HeadError::Config(format!("unknown WAL sync mode: {}", other))),
        }
    }
}

/// Writer tuning
#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    pub sync_mode: WalSyncMode,
    /// Batch sync threshold (bytes)
    pub sync_threshold: usize,
    /// Segment roll size (bytes)
    pub segment_size: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_mode: WalSyncMode::Batched,
            sync_threshold: 64 * 1024, // 64KB default batch
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

/// Segment file name for a sequence number
pub fn segment_name(seq: u32) -> String {
    format!("{:08}", seq)
}

/// List the segment files of a WAL directory in sequence order
pub fn list_segments(dir: &Path) -> HeadResult<Vec<(u32, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let seq = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.len() == 8)
            .and_then(|n| n.parse::<u32>().ok());
        match seq {
            Some(seq) => segments.push((seq, path)),
            None => tracing::warn!("Ignoring non-segment file in WAL directory: {:?}", path),
        }
    }

    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

struct SegmentWriter {
    writer: BufWriter<File>,
    seq: u32,
    segment_bytes: u64,
    bytes_since_sync: usize,
}

impl SegmentWriter {
    fn create(dir: &Path, seq: u32) -> HeadResult<Self> {
        let path = dir.join(segment_name(seq));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        tracing::debug!("Opened WAL segment {:?}", path);

        Ok(Self {
            writer: BufWriter::new(file),
            seq,
            segment_bytes: 0,
            bytes_since_sync: 0,
        })
    }

    fn sync(&mut self) -> HeadResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.bytes_since_sync = 0;
        Ok(())
    }
}

/// Append-only WAL owned by one head
///
/// Writes are serialized by an internal mutex; `log` may be called from
/// any number of threads.
pub struct HeadWal {
    dir: PathBuf,
    created_at: DateTime<Utc>,
    options: WalOptions,
    /// `None` once stopped
    segment: Mutex<Option<SegmentWriter>>,
    records: std::sync::atomic::AtomicU64,
}

impl HeadWal {
    /// Open a WAL directory, starting a fresh segment
    pub fn open(
        dir: impl AsRef<Path>,
        created_at: DateTime<Utc>,
        options: WalOptions,
    ) -> HeadResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let next_seq = list_segments(&dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0);
        let segment = SegmentWriter::create(&dir, next_seq)?;

        Ok(Self {
            dir,
            created_at,
            options,
            segment: Mutex::new(Some(segment)),
            records: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of records written by this writer
    pub fn record_count(&self) -> u64 {
        self.records.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Append one record
    pub fn log(&self, record: &WalRecord) -> HeadResult<()> {
        self.log_all(std::slice::from_ref(record))
    }

    /// Append several records, applying the sync discipline once
    pub fn log_all(&self, records: &[WalRecord]) -> HeadResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut payloads = Vec::with_capacity(records.len());
        for record in records {
            let mut buf = Vec::new();
            record.encode(&mut buf)?;
            payloads.push(buf);
        }

        let mut guard = self.segment.lock();
        let segment = guard.as_mut().ok_or(HeadError::WalClosed)?;
        for payload in &payloads {
            self.write_envelope(segment, payload)?;
        }
        self.maybe_sync(segment)?;

        self.records.fetch_add(
            records.len() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(())
    }

    /// Append a raw payload inside a valid envelope
    #[cfg(test)]
    pub(crate) fn log_bytes(&self, payload: &[u8]) -> HeadResult<()> {
        let mut guard = self.segment.lock();
        let segment = guard.as_mut().ok_or(HeadError::WalClosed)?;
        self.write_envelope(segment, payload)?;
        self.maybe_sync(segment)
    }

    fn write_envelope(&self, segment: &mut SegmentWriter, payload: &[u8]) -> HeadResult<()> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(HeadError::Serialization(format!(
                "WAL record too large: {} bytes",
                payload.len()
            )));
        }

        let entry_size = (ENVELOPE_OVERHEAD + payload.len()) as u64;
        if segment.segment_bytes > 0
            && segment.segment_bytes + entry_size > self.options.segment_size
        {
            self.roll(segment)?;
        }

        let len_bytes = (payload.len() as u32).to_le_bytes();

        // Calculate CRC
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(payload);
        let crc = hasher.finalize();

        // Write: length (4) + data (N) + crc (4)
        segment.writer.write_all(&len_bytes)?;
        segment.writer.write_all(payload)?;
        segment.writer.write_all(&crc.to_le_bytes())?;

        segment.segment_bytes += entry_size;
        segment.bytes_since_sync += entry_size as usize;
        Ok(())
    }

    /// Close the full segment and continue in the next one
    fn roll(&self, segment: &mut SegmentWriter) -> HeadResult<()> {
        segment.sync()?;
        let next = SegmentWriter::create(&self.dir, segment.seq + 1)?;
        tracing::debug!(
            "Rolled WAL {:?} to segment {} after {} bytes",
            self.dir,
            next.seq,
            segment.segment_bytes
        );
        *segment = next;
        Ok(())
    }

    /// Conditionally sync based on mode and threshold
    fn maybe_sync(&self, segment: &mut SegmentWriter) -> HeadResult<()> {
        match self.options.sync_mode {
            WalSyncMode::EveryWrite => {
                segment.sync()?;
            }
            WalSyncMode::Batched => {
                segment.writer.flush()?;
                if segment.bytes_since_sync >= self.options.sync_threshold {
                    segment.sync()?;
                }
            }
            WalSyncMode::None => {
                // Just flush the buffer, no fsync
                segment.writer.flush()?;
            }
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> HeadResult<()> {
        let mut guard = self.segment.lock();
        let segment = guard.as_mut().ok_or(HeadError::WalClosed)?;
        segment.sync()
    }

    /// Flush and close the active segment. Later `log` calls fail.
    pub fn stop(&self) -> HeadResult<()> {
        let segment = self.segment.lock().take();
        match segment {
            Some(mut segment) => segment.sync(),
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.segment.lock().is_none()
    }
}

/// Classification of one envelope read from a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Intact envelope; payload not yet decoded
    Record { offset: u64, payload: Vec<u8> },
    /// Clean end of segment at a record boundary
    End,
    /// Segment ends inside an envelope
    Torn { offset: u64 },
    /// Envelope complete but its checksum does not match
    ChecksumMismatch { offset: u64 },
    /// Declared length is implausible
    Malformed { offset: u64, len: u32 },
}

/// Sequential envelope reader over one segment file
pub struct SegmentReader {
    reader: BufReader<File>,
    path: PathBuf,
    offset: u64,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> HeadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path,
            offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next envelope.
    ///
    /// I/O failures other than running out of bytes are returned as errors.
    pub fn next_envelope(&mut self) -> HeadResult<Envelope> {
        let start = self.offset;

        // Read length
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(Envelope::End),
            4 => {}
            _ => return Ok(Envelope::Torn { offset: start }),
        }
        let len = u32::from_le_bytes(len_buf);
        if len as usize > MAX_RECORD_SIZE {
            return Ok(Envelope::Malformed { offset: start, len });
        }

        // Read data
        let mut payload = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            return Ok(Envelope::Torn { offset: start });
        }

        // Read CRC
        let mut crc_buf = [0u8; 4];
        if read_full(&mut self.reader, &mut crc_buf)? < crc_buf.len() {
            return Ok(Envelope::Torn { offset: start });
        }
        let stored_crc = u32::from_le_bytes(crc_buf);

        // Verify CRC
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Ok(Envelope::ChecksumMismatch { offset: start });
        }

        self.offset += (ENVELOPE_OVERHEAD + payload.len()) as u64;
        Ok(Envelope::Record {
            offset: start,
            payload,
        })
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{ChunkMeta, LabelSet};
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    fn sample_records(n: usize) -> Vec<WalRecord> {
        let labels: LabelSet = r#"{foo="bar"}"#.parse().unwrap();
        (0..n)
            .map(|i| WalRecord::chunk_metas("tenant1", labels.stable_hash(), &[ChunkMeta::new(i as i64, i as i64 + 10, i as u32)]))
            .collect()
    }

    fn read_all(path: &Path) -> Vec<Envelope> {
        let mut reader = SegmentReader::open(path).unwrap();
        let mut out = Vec::new();
        loop {
            let env = reader.next_envelope().unwrap();
            let done = !matches!(env, Envelope::Record { .. });
            out.push(env);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_wal_basic_operations() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("1700000000");

        let wal = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        let records = sample_records(2);
        wal.log(&records[0]).unwrap();
        wal.log(&records[1]).unwrap();
        assert_eq!(wal.record_count(), 2);
        wal.stop().unwrap();

        let segments = list_segments(&wal_dir).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, 0);

        let envelopes = read_all(&segments[0].1);
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[2], Envelope::End);
        match &envelopes[1] {
            Envelope::Record { payload, .. } => {
                assert_eq!(WalRecord::decode(payload).unwrap(), records[1]);
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_wal_log_after_stop_fails() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("wal"), Utc::now(), WalOptions::default()).unwrap();

        wal.stop().unwrap();
        assert!(wal.is_stopped());
        assert!(matches!(
            wal.log(&sample_records(1)[0]),
            Err(HeadError::WalClosed)
        ));
        // Stopping twice is fine
        wal.stop().unwrap();
    }

    #[test]
    fn test_reopen_starts_new_segment() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("wal");

        for _ in 0..3 {
            let wal = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
            wal.log(&sample_records(1)[0]).unwrap();
            wal.stop().unwrap();
        }

        let names: Vec<String> = list_segments(&wal_dir)
            .unwrap()
            .into_iter()
            .map(|(_, p)| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["00000000", "00000001", "00000002"]);
    }

    #[test]
    fn test_segment_roll() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let options = WalOptions {
            sync_mode: WalSyncMode::None,
            segment_size: 256,
            ..WalOptions::default()
        };

        let wal = HeadWal::open(&wal_dir, Utc::now(), options).unwrap();
        let records = sample_records(50);
        for record in &records {
            wal.log(record).unwrap();
        }
        wal.stop().unwrap();

        let segments = list_segments(&wal_dir).unwrap();
        assert!(segments.len() > 1);

        let mut total = 0;
        for (_, path) in &segments {
            assert!(std::fs::metadata(path).unwrap().len() <= 256);
            total += read_all(path)
                .iter()
                .filter(|e| matches!(e, Envelope::Record { .. }))
                .count();
        }
        assert_eq!(total, 50);
    }

    #[test]
    fn test_torn_tail_detection() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("wal");

        let wal = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        for record in sample_records(3) {
            wal.log(&record).unwrap();
        }
        wal.stop().unwrap();

        let segment = wal_dir.join(segment_name(0));
        let len = std::fs::metadata(&segment).unwrap().len();
        let file = OpenOptions::new().write(true).open(&segment).unwrap();
        file.set_len(len - 3).unwrap();

        let envelopes = read_all(&segment);
        assert_eq!(envelopes.len(), 3);
        assert!(matches!(envelopes[2], Envelope::Torn { .. }));
    }

    #[test]
    fn test_crc_corruption_detection() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("wal");

        let wal = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        wal.log(&sample_records(1)[0]).unwrap();
        wal.stop().unwrap();

        // Corrupt the payload
        let segment = wal_dir.join(segment_name(0));
        {
            let mut file = OpenOptions::new().write(true).open(&segment).unwrap();
            file.seek(SeekFrom::Start(10)).unwrap();
            file.write_all(&[0xFF, 0xFF]).unwrap();
        }

        let envelopes = read_all(&segment);
        assert_eq!(envelopes, vec![Envelope::ChecksumMismatch { offset: 0 }]);
    }

    #[test]
    fn test_malformed_length() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join(segment_name(0));
        std::fs::write(&segment, u32::MAX.to_le_bytes()).unwrap();

        let envelopes = read_all(&segment);
        assert_eq!(
            envelopes,
            vec![Envelope::Malformed {
                offset: 0,
                len: u32::MAX
            }]
        );
    }

    #[test]
    fn test_sync_mode_parse() {
        assert_eq!("every_write".parse::<WalSyncMode>().unwrap(), WalSyncMode::EveryWrite);
        assert_eq!("Batched".parse::<WalSyncMode>().unwrap(), WalSyncMode::Batched);
        assert_eq!("none".parse::<WalSyncMode>().unwrap(), WalSyncMode::None);
        assert!("sometimes".parse::<WalSyncMode>().is_err());
    }
}
