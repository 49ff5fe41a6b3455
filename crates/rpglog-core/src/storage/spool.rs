//! Spool directory sender.
//!
//! Each flushed batch becomes one file in the spool directory, picked up by
//! whatever ships data off the host. Creating a file named `DISABLED` in the
//! directory turns collection off: batches are then discarded.
//!
//! File layout:
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ HEADER (48 bytes, uncompressed)                         │
//! │   magic: [u8; 4]              = b"RPGL"                 │
//! │   version: u16                = 1                       │
//! │   _reserved: u16              = 0                       │
//! │   crc32: u32                  (of the payload bytes)    │
//! │   line_count: u32                                       │
//! │   sample_count: u32                                     │
//! │   uncompressed_len: u32                                 │
//! │   created_at: i64             (unix millis)             │
//! │   first_occurred_at: i64      (unix millis, 0 if none)  │
//! │   last_occurred_at: i64       (unix millis, 0 if none)  │
//! ├─────────────────────────────────────────────────────────┤
//! │ PAYLOAD                                                 │
//! │   zstd(postcard(LogBatch))                              │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::model::{LogLine, QuerySample};

const MAGIC: [u8; 4] = *b"RPGL";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 48;
const ZSTD_LEVEL: i32 = 3;

/// Batch file extension.
pub const BATCH_EXTENSION: &str = "rpgl";
/// Presence of this file in the spool directory disables collection.
pub const DISABLED_FILE: &str = "DISABLED";

/// One flush worth of classified output for a server.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct LogBatch {
    pub server: String,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<LogLine>,
    pub samples: Vec<QuerySample>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.samples.is_empty()
    }
}

/// Error returned by a [`BatchSender`].
#[derive(Debug)]
pub enum SendError {
    /// Collection is turned off on the receiving side; the batch is dropped.
    CollectionDisabled,
    Io(io::Error),
    Encode(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::CollectionDisabled => write!(f, "log collection is disabled"),
            SendError::Io(e) => write!(f, "I/O error: {}", e),
            SendError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        SendError::Io(e)
    }
}

/// Destination for classified batches.
pub trait BatchSender {
    fn send(&mut self, batch: &LogBatch) -> Result<(), SendError>;
}

/// Writes batches as files into a spool directory.
pub struct SpoolSender {
    dir: PathBuf,
    seq: u64,
}

impl SpoolSender {
    /// Opens (and creates if needed) the spool directory.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        // Leftovers from an interrupted write.
        for entry in fs::read_dir(&dir)?.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }

        Ok(Self { dir, seq: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_disabled(&self) -> bool {
        self.dir.join(DISABLED_FILE).exists()
    }

    fn batch_path(&mut self, batch: &LogBatch) -> PathBuf {
        self.seq += 1;
        let server: String = batch
            .server
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!(
            "{}_{}_{:06}.{}",
            server,
            batch.created_at.timestamp_millis(),
            self.seq,
            BATCH_EXTENSION
        ))
    }
}

impl BatchSender for SpoolSender {
    fn send(&mut self, batch: &LogBatch) -> Result<(), SendError> {
        if self.is_disabled() {
            return Err(SendError::CollectionDisabled);
        }
        let path = self.batch_path(batch);
        let written = write_batch(&path, batch)?;
        debug!(
            server = %batch.server,
            lines = batch.lines.len(),
            samples = batch.samples.len(),
            bytes = written,
            path = %path.display(),
            "spooled log batch"
        );
        Ok(())
    }
}

fn encode_header(
    batch: &LogBatch,
    payload: &[u8],
    uncompressed_len: usize,
) -> Result<[u8; HEADER_SIZE], SendError> {
    let line_count = u32::try_from(batch.lines.len())
        .map_err(|_| SendError::Encode("too many lines for batch format".into()))?;
    let sample_count = u32::try_from(batch.samples.len())
        .map_err(|_| SendError::Encode("too many samples for batch format".into()))?;
    let uncompressed_len = u32::try_from(uncompressed_len)
        .map_err(|_| SendError::Encode("batch too large".into()))?;

    let first = batch.lines.iter().map(|l| l.occurred_at).min();
    let last = batch.lines.iter().map(|l| l.occurred_at).max();

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    // bytes 6..8 = reserved
    header[8..12].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    header[12..16].copy_from_slice(&line_count.to_le_bytes());
    header[16..20].copy_from_slice(&sample_count.to_le_bytes());
    header[20..24].copy_from_slice(&uncompressed_len.to_le_bytes());
    header[24..32].copy_from_slice(&batch.created_at.timestamp_millis().to_le_bytes());
    header[32..40].copy_from_slice(&first.map_or(0, |t| t.timestamp_millis()).to_le_bytes());
    header[40..48].copy_from_slice(&last.map_or(0, |t| t.timestamp_millis()).to_le_bytes());
    Ok(header)
}

/// Writes `batch` to `path` atomically via a `.tmp` file. Returns bytes written.
pub fn write_batch(path: &Path, batch: &LogBatch) -> Result<usize, SendError> {
    let raw = postcard::to_allocvec(batch).map_err(|e| SendError::Encode(e.to_string()))?;
    let payload = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;
    let header = encode_header(batch, &payload, raw.len())?;

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(HEADER_SIZE + payload.len())
}

/// Summary from a batch file header.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchHeader {
    pub line_count: usize,
    pub sample_count: usize,
    pub created_at_ms: i64,
    pub first_occurred_at_ms: i64,
    pub last_occurred_at_ms: i64,
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_i64(data: &[u8], at: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    i64::from_le_bytes(buf)
}

fn parse_header(data: &[u8]) -> io::Result<(BatchHeader, u32, usize)> {
    if data.len() < HEADER_SIZE {
        return Err(io::Error::other("file too small for header"));
    }

    let magic = &data[0..4];
    if magic != MAGIC {
        return Err(io::Error::other(format!(
            "invalid magic: expected RPGL, got {:?}",
            magic
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(io::Error::other(format!("unsupported version: {}", version)));
    }

    let header = BatchHeader {
        line_count: read_u32(data, 12) as usize,
        sample_count: read_u32(data, 16) as usize,
        created_at_ms: read_i64(data, 24),
        first_occurred_at_ms: read_i64(data, 32),
        last_occurred_at_ms: read_i64(data, 40),
    };
    Ok((header, read_u32(data, 8), read_u32(data, 20) as usize))
}

/// Reads only the header of a batch file.
pub fn read_batch_header(path: &Path) -> io::Result<BatchHeader> {
    let data = fs::read(path)?;
    parse_header(&data).map(|(header, _, _)| header)
}

/// Reads, verifies and decodes a batch file.
pub fn read_batch(path: &Path) -> io::Result<LogBatch> {
    let data = fs::read(path)?;
    let (header, crc, uncompressed_len) = parse_header(&data)?;

    let payload = &data[HEADER_SIZE..];
    if crc32fast::hash(payload) != crc {
        return Err(io::Error::other("checksum mismatch"));
    }

    let raw = zstd::decode_all(payload)?;
    if raw.len() != uncompressed_len {
        return Err(io::Error::other(format!(
            "payload length mismatch: header says {}, got {}",
            uncompressed_len,
            raw.len()
        )));
    }
    let batch: LogBatch = postcard::from_bytes(&raw)
        .map_err(|e| io::Error::other(format!("failed to decode batch: {}", e)))?;

    if batch.lines.len() != header.line_count || batch.samples.len() != header.sample_count {
        return Err(io::Error::other("record counts do not match header"));
    }
    Ok(batch)
}

/// Batch files in `dir`, oldest first.
pub fn list_batches(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == BATCH_EXTENSION))
        .collect();
    paths.sort_by_key(|p| {
        read_batch_header(p)
            .map(|h| h.created_at_ms)
            .unwrap_or(i64::MAX)
    });
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{DetailValue, LogClassification, LogLevel};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_batch(server: &str, lines: usize) -> LogBatch {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let lines: Vec<LogLine> = (0..lines)
            .map(|i| {
                let at = base + chrono::Duration::seconds(i as i64);
                let mut l = LogLine::new(at, at);
                l.backend_pid = 100 + i as i32;
                l.log_level = LogLevel::Error;
                l.classification = LogClassification::DivisionByZero;
                l.details
                    .insert("constraint_name".into(), DetailValue::Text("pk".into()));
                l.query = Some("SELECT 1/0".into());
                l
            })
            .collect();
        let samples = lines
            .iter()
            .map(|l| QuerySample {
                occurred_at: l.occurred_at,
                username: Some("app".into()),
                database: None,
                query: "SELECT 1".into(),
                runtime_ms: 1.5,
                parameters: vec![Some("a".into()), None],
                log_line_uuid: l.uuid,
                explain: None,
            })
            .collect();
        LogBatch {
            server: server.to_string(),
            created_at: base,
            lines,
            samples,
        }
    }

    #[test]
    fn test_send_and_read_back() {
        let dir = tempdir().unwrap();
        let mut sender = SpoolSender::new(dir.path()).unwrap();
        let batch = sample_batch("primary", 3);

        sender.send(&batch).unwrap();

        let files = list_batches(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let loaded = read_batch(&files[0]).unwrap();
        assert_eq!(loaded, batch);

        let header = read_batch_header(&files[0]).unwrap();
        assert_eq!(header.line_count, 3);
        assert_eq!(header.sample_count, 3);
        assert_eq!(header.last_occurred_at_ms - header.first_occurred_at_ms, 2000);
    }

    #[test]
    fn test_batch_is_empty() {
        let mut batch = sample_batch("primary", 1);
        assert!(!batch.is_empty());
        batch.lines.clear();
        assert!(!batch.is_empty());
        batch.samples.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_disabled_file() {
        let dir = tempdir().unwrap();
        let mut sender = SpoolSender::new(dir.path()).unwrap();
        fs::write(dir.path().join(DISABLED_FILE), b"").unwrap();

        let err = sender.send(&sample_batch("primary", 1)).unwrap_err();
        assert!(matches!(err, SendError::CollectionDisabled));
        assert!(list_batches(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let dir = tempdir().unwrap();
        let spool = dir.path().join("spool");
        let mut sender = SpoolSender::new(&spool).unwrap();
        fs::remove_dir_all(&spool).unwrap();

        let err = sender.send(&sample_batch("primary", 1)).unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.rpgl");
        write_batch(&path, &sample_batch("primary", 2)).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = read_batch(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.rpgl");
        fs::write(&path, [0u8; HEADER_SIZE + 4]).unwrap();
        assert!(read_batch(&path).is_err());
        assert!(read_batch_header(&path).is_err());
    }

    #[test]
    fn test_server_name_sanitized_in_file_name() {
        let dir = tempdir().unwrap();
        let mut sender = SpoolSender::new(dir.path()).unwrap();
        sender.send(&sample_batch("db/primary 1", 1)).unwrap();

        let files = list_batches(dir.path()).unwrap();
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("db_primary_1_"));
    }

    #[test]
    fn test_stale_tmp_removed_on_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.tmp"), b"partial").unwrap();
        SpoolSender::new(dir.path()).unwrap();
        assert!(!dir.path().join("old.tmp").exists());
    }
}
