//! File tailer for reading new lines from a growing log file.
//!
//! Supports log rotation detection via inode tracking (Linux)
//! and file size comparison, and resuming from a persisted [`FileMarker`].

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Maximum number of lines to read in a single `read_new_lines()` call.
/// Prevents unbounded memory usage if the log file has a huge backlog.
const MAX_LINES_PER_READ: usize = 10_000;

/// Resume position in a log file.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct FileMarker {
    pub inode: u64,
    /// Byte offset of the first unread byte.
    pub offset: u64,
}

/// One complete line read from the file.
#[derive(Debug, Clone, PartialEq)]
pub struct TailedLine {
    /// Line text including the trailing `\n`.
    pub text: String,
    /// Absolute offset of the line's first byte in the file.
    pub byte_start: i64,
    /// Bytes the line occupies in the file. Invalid UTF-8 is replaced in
    /// `text`, so `text.len()` can differ.
    pub byte_len: i64,
}

/// Reads new lines appended to a file since the last read position.
///
/// Only complete lines are returned; a partially written last line is left
/// in place until its newline arrives.
/// Detects log rotation via inode change or file truncation.
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Create a new tailer, starting from the end of the file.
    ///
    /// Returns `Err` if the file does not exist or cannot be stat'd.
    pub fn new(path: PathBuf) -> io::Result<Self> {
        Self::resume(path, None)
    }

    /// Create a tailer that continues from `marker`.
    ///
    /// The marker is honored when it refers to the same inode and the file
    /// is at least that long. A marker for a different inode means the file
    /// was rotated while nobody was reading: the new file is read from the
    /// start. Without a marker the tailer starts at the end of the file.
    pub fn resume(path: PathBuf, marker: Option<FileMarker>) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        let inode = get_inode(&metadata);
        let len = metadata.len();

        let offset = match marker {
            Some(m) if m.inode == inode && m.offset <= len => m.offset,
            Some(m) => {
                info!(
                    path = %path.display(),
                    marker_offset = m.offset,
                    "log file changed since last run, reading from start"
                );
                0
            }
            None => len,
        };

        Ok(Self {
            path,
            offset,
            inode,
        })
    }

    /// Read complete lines appended since the last call.
    ///
    /// If the file was rotated (inode changed or size decreased),
    /// re-opens from the beginning of the new file.
    ///
    /// Returns at most `MAX_LINES_PER_READ` lines per call.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<TailedLine>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // File gone (rotation in progress), try next time
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let current_inode = get_inode(&metadata);
        let current_size = metadata.len();

        // Detect rotation: inode changed or file truncated
        if current_inode != self.inode || current_size < self.offset {
            debug!(path = %self.path.display(), "log file rotated");
            self.inode = current_inode;
            self.offset = 0;
        }

        if current_size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;

        let mut reader = BufReader::new(&mut file);
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                // EOF or incomplete last line
                break;
            }
            lines.push(TailedLine {
                text: String::from_utf8_lossy(&buf).into_owned(),
                byte_start: self.offset as i64,
                byte_len: n as i64,
            });
            self.offset += n as u64;
        }

        Ok(lines)
    }

    /// Switch to a different file (after log rotation detection from PG).
    ///
    /// Starts reading from the beginning of the new file.
    pub fn switch_file(&mut self, new_path: PathBuf) -> io::Result<()> {
        if new_path == self.path {
            return Ok(());
        }

        let metadata = fs::metadata(&new_path)?;
        self.inode = get_inode(&metadata);
        self.offset = 0;
        self.path = new_path;

        Ok(())
    }

    /// Returns the current file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position after the last complete line returned.
    pub fn marker(&self) -> FileMarker {
        FileMarker {
            inode: self.inode,
            offset: self.offset,
        }
    }
}

/// Extract inode from file metadata (Linux-specific).
#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Fallback for non-Unix: always returns 0, relying on size-based rotation detection.
#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn texts(lines: &[TailedLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    fn append(path: &Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    #[test]
    fn test_tailer_new_starts_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "old line 1\nold line 2\n").unwrap();

        let mut tailer = FileTailer::new(path).unwrap();
        assert!(tailer.read_new_lines().unwrap().is_empty());
        assert_eq!(tailer.marker().offset, 22);
    }

    #[test]
    fn test_tailer_reads_new_lines_with_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        std::fs::write(&path, "old\n").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        append(&path, "new line 1\nnew line 2\n");

        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["new line 1\n", "new line 2\n"]);
        assert_eq!(lines[0].byte_start, 4);
        assert_eq!(lines[1].byte_start, 15);

        assert!(tailer.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn test_tailer_invalid_utf8_keeps_file_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        f.write_all(b"bad \xff line\nnext\n").unwrap();

        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["bad \u{FFFD} line\n", "next\n"]);
        assert_eq!(lines[0].byte_len, 11);
        assert_eq!(lines[0].text.len(), 13);
        assert_eq!(lines[1].byte_start, 11);
        assert_eq!(tailer.marker().offset, 16);
    }

    #[test]
    fn test_tailer_waits_for_complete_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        append(&path, "partial");
        assert!(tailer.read_new_lines().unwrap().is_empty());
        assert_eq!(tailer.marker().offset, 0);

        append(&path, " line\n");
        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["partial line\n"]);
        assert_eq!(lines[0].byte_start, 0);
    }

    #[test]
    fn test_tailer_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        std::fs::write(&path, "a".repeat(1000)).unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        std::fs::write(&path, "after rotation\n").unwrap();

        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["after rotation\n"]);
    }

    #[test]
    fn test_tailer_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");

        std::fs::write(&path, "content\n").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(tailer.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn test_tailer_switch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path1 = dir.path().join("log1.log");
        let path2 = dir.path().join("log2.log");

        std::fs::write(&path1, "old file\n").unwrap();
        std::fs::write(&path2, "new file line\n").unwrap();

        let mut tailer = FileTailer::new(path1).unwrap();
        tailer.switch_file(path2.clone()).unwrap();

        let lines = tailer.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["new file line\n"]);
        assert_eq!(tailer.path(), path2);
    }

    #[test]
    fn test_resume_from_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut tailer = FileTailer::resume(path.clone(), None).unwrap();
        let marker = FileMarker {
            inode: tailer.marker().inode,
            offset: 6,
        };
        assert!(tailer.read_new_lines().unwrap().is_empty());

        let mut resumed = FileTailer::resume(path.clone(), Some(marker)).unwrap();
        let lines = resumed.read_new_lines().unwrap();
        assert_eq!(texts(&lines), vec!["second\n"]);
        assert_eq!(lines[0].byte_start, 6);
    }

    #[test]
    fn test_resume_with_stale_marker_reads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "only\n").unwrap();

        let inode = FileTailer::new(path.clone()).unwrap().marker().inode;
        let stale = FileMarker {
            inode,
            offset: 10_000,
        };
        let mut tailer = FileTailer::resume(path, Some(stale)).unwrap();
        assert_eq!(texts(&tailer.read_new_lines().unwrap()), vec!["only\n"]);
    }
}
