//! PostgreSQL log pipeline.
//!
//! Raw lines from any source (file tail, or envelope receivers that already
//! split off timestamp and pid) enter a per-server bounded queue. A transform
//! thread parses prefixes, reassembles continuations, holds lines in the
//! dwell buffer and periodically hands classified batches to a
//! [`BatchSender`].

pub mod classify;
pub mod locate;
pub mod parser;
pub mod reassemble;
pub mod stream;
pub mod tailer;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::storage::model::{LogLevel, LogLine};
use crate::storage::spool::BatchSender;
use crate::storage::state::ServerState;

use parser::{PrefixParser, split_level};
use stream::LogStream;
use tailer::{FileMarker, TailedLine};

/// Default capacity of a server's source queue, in messages.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// A dropped-message warning is logged once per this many drops.
const DROP_WARN_EVERY: u64 = 1000;

// ============================================================
// Source side
// ============================================================

/// One physical line as delivered by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogLine {
    /// Line text, including the trailing newline if the source had one.
    pub content: String,
    /// Offset of the line in its source stream.
    pub byte_start: i64,
    /// Bytes the line occupies in its source stream. Larger or smaller than
    /// `content.len()` when the source replaced invalid UTF-8.
    pub byte_len: i64,
    /// Set by envelope sources that carry the timestamp outside the text.
    /// When present, no prefix parsing takes place.
    pub occurred_at: Option<DateTime<Utc>>,
    pub backend_pid: Option<i32>,
}

impl RawLogLine {
    /// A line read from a log file, still carrying its prefix.
    pub fn from_file(content: impl Into<String>, byte_start: i64) -> Self {
        let content = content.into();
        Self {
            byte_len: content.len() as i64,
            content,
            byte_start,
            occurred_at: None,
            backend_pid: None,
        }
    }

    /// A line whose timestamp and pid arrived as envelope metadata.
    pub fn with_envelope(
        content: impl Into<String>,
        occurred_at: DateTime<Utc>,
        backend_pid: Option<i32>,
    ) -> Self {
        let content = content.into();
        Self {
            byte_len: content.len() as i64,
            content,
            byte_start: 0,
            occurred_at: Some(occurred_at),
            backend_pid,
        }
    }
}

impl From<TailedLine> for RawLogLine {
    fn from(line: TailedLine) -> Self {
        Self {
            content: line.text,
            byte_start: line.byte_start,
            byte_len: line.byte_len,
            occurred_at: None,
            backend_pid: None,
        }
    }
}

/// Message on a server's source queue.
#[derive(Debug)]
pub enum SourceMessage {
    Lines(Vec<RawLogLine>),
    /// Position a file source has read up to. Sent after the lines it covers.
    Marker { file: PathBuf, marker: FileMarker },
}

/// Producer handle for a server's bounded source queue.
///
/// A full queue drops the newest message instead of blocking the source.
#[derive(Clone)]
pub struct LogSourceSender {
    server: Arc<str>,
    tx: SyncSender<SourceMessage>,
    dropped: Arc<AtomicU64>,
}

impl LogSourceSender {
    /// Enqueue `message`. Returns `false` once the collector has shut down.
    pub fn send(&self, message: SourceMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_WARN_EVERY == 1 {
                    warn!(
                        server = %self.server,
                        dropped,
                        "log source queue full, dropping messages"
                    );
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn send_lines(&self, lines: Vec<RawLogLine>) -> bool {
        if lines.is_empty() {
            return true;
        }
        self.send(SourceMessage::Lines(lines))
    }

    pub fn send_marker(&self, file: PathBuf, marker: FileMarker) -> bool {
        self.send(SourceMessage::Marker { file, marker })
    }

    /// Total messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================
// Transform
// ============================================================

/// Single-threaded state of one server's pipeline.
///
/// [`LogCollector`] drives it from its own thread; it can also be driven
/// directly with explicit timestamps.
pub struct LogTransform {
    parser: PrefixParser,
    stream: LogStream,
    /// File markers not yet covered by a successful send, with the time they
    /// were received.
    pending_markers: Vec<(DateTime<Utc>, PathBuf, FileMarker)>,
    state: ServerState,
}

impl LogTransform {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            parser: PrefixParser::new(config.prefix_format, config.timezone),
            stream: LogStream::new(config.name.clone()),
            pending_markers: Vec::new(),
            state: ServerState {
                prefix_format: config.prefix_format,
                ..Default::default()
            },
        }
    }

    pub fn server(&self) -> &str {
        self.stream.server()
    }

    /// Accepts one raw line received at `collected_at`.
    pub fn ingest(&mut self, raw: RawLogLine, collected_at: DateTime<Utc>) {
        if let Some(occurred_at) = raw.occurred_at {
            self.stream.push(envelope_line(raw, occurred_at, collected_at));
            return;
        }

        match self.parser.parse_line(&raw.content, raw.byte_start, collected_at) {
            Some(mut line) => {
                line.byte_end = raw.byte_start + raw.byte_len - 1;
                self.stream.push(line);
            }
            None => {
                if !self.stream.append_continuation(&raw.content, raw.byte_len) {
                    trace!(
                        server = self.server(),
                        "dropping continuation without a primary line"
                    );
                }
            }
        }
    }

    /// Records that a file source has read up to `marker`.
    pub fn note_marker(&mut self, file: PathBuf, marker: FileMarker, received_at: DateTime<Utc>) {
        self.pending_markers.push((received_at, file, marker));
    }

    /// Releases aged lines and commits file markers whose lines have all
    /// left the dwell buffer.
    pub fn flush(&mut self, now: DateTime<Utc>, sender: &mut dyn BatchSender) {
        self.stream.flush(now, sender);
        self.commit_markers();
        self.state.prefix_format = self.parser.format();
    }

    /// Final flush. Lines too fresh to release are discarded and their
    /// markers stay uncommitted, so a restart reads them again.
    pub fn finish(&mut self, now: DateTime<Utc>, sender: &mut dyn BatchSender) -> usize {
        self.flush(now, sender);
        let discarded = self.stream.discard();
        self.pending_markers.clear();
        discarded
    }

    /// Committed state: resolved prefix format and safe resume markers.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn held(&self) -> usize {
        self.stream.held().len()
    }

    fn commit_markers(&mut self) {
        let oldest_held = self.stream.held().iter().map(|l| l.collected_at).min();
        let (safe, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_markers)
            .into_iter()
            .partition(|(received_at, _, _)| {
                oldest_held.is_none_or(|oldest| *received_at < oldest)
            });

        for (_, file, marker) in safe {
            self.state.set_marker(&file, marker);
        }
        self.pending_markers = pending;
    }
}

/// Builds a line from an envelope source. Content without a level keyword
/// becomes an `Unknown` line that the dwell buffer merges into its
/// predecessor.
fn envelope_line(
    raw: RawLogLine,
    occurred_at: DateTime<Utc>,
    collected_at: DateTime<Utc>,
) -> LogLine {
    let (level, content) = match split_level(&raw.content) {
        Some((level, content)) => (level, content),
        None => (LogLevel::Unknown, raw.content.as_str()),
    };
    let content_offset = (raw.content.len() - content.len()) as i64;

    let mut line = LogLine::new(occurred_at, collected_at);
    line.log_level = level;
    line.backend_pid = raw.backend_pid.unwrap_or(0);
    line.content = content.to_string();
    line.byte_start = raw.byte_start;
    line.byte_content_start = raw.byte_start + content_offset;
    line.byte_end = raw.byte_start + raw.byte_len - 1;
    line
}

// ============================================================
// Collector thread
// ============================================================

/// Tunables of a [`LogCollector`].
#[derive(Debug, Clone, Copy)]
pub struct CollectorOptions {
    pub queue_size: usize,
    /// How often the dwell buffer is flushed.
    pub flush_interval: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Owns the transform thread of one server.
///
/// Sources obtain producers with [`LogCollector::source`]. The thread exits
/// after [`LogCollector::shutdown`] once every producer has been dropped.
pub struct LogCollector {
    server: String,
    tx: Option<SyncSender<SourceMessage>>,
    dropped: Arc<AtomicU64>,
    state: Arc<Mutex<ServerState>>,
    handle: Option<JoinHandle<()>>,
}

impl LogCollector {
    pub fn spawn(
        config: ServerConfig,
        sender: Box<dyn BatchSender + Send>,
        options: CollectorOptions,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(options.queue_size.max(1));
        let transform = LogTransform::new(&config);
        let state = Arc::new(Mutex::new(transform.state().clone()));

        let thread_state = Arc::clone(&state);
        let interval = options.flush_interval;
        let handle = thread::Builder::new()
            .name(format!("rpglog-{}", config.name))
            .spawn(move || run_transform(transform, rx, sender, interval, thread_state))?;

        info!(server = %config.name, queue_size = options.queue_size, "log collector started");

        Ok(Self {
            server: config.name,
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
            state,
            handle: Some(handle),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// A new producer for this server's queue.
    pub fn source(&self) -> Option<LogSourceSender> {
        self.tx.as_ref().map(|tx| LogSourceSender {
            server: Arc::from(self.server.as_str()),
            tx: tx.clone(),
            dropped: Arc::clone(&self.dropped),
        })
    }

    /// Snapshot of the committed state, as of the last flush.
    pub fn state(&self) -> ServerState {
        lock_state(&self.state).clone()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits for the final flush.
    ///
    /// Producers handed out by [`LogCollector::source`] must be dropped
    /// first, otherwise this blocks until they are.
    pub fn shutdown(mut self) -> ServerState {
        self.tx = None;
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(server = %self.server, "log collector thread panicked");
        }
        self.state()
    }
}

fn lock_state(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_transform(
    mut transform: LogTransform,
    rx: Receiver<SourceMessage>,
    mut sender: Box<dyn BatchSender + Send>,
    interval: Duration,
    shared: Arc<Mutex<ServerState>>,
) {
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(interval) {
            Ok(SourceMessage::Lines(lines)) => {
                let collected_at = Utc::now();
                for raw in lines {
                    transform.ingest(raw, collected_at);
                }
            }
            Ok(SourceMessage::Marker { file, marker }) => {
                transform.note_marker(file, marker, Utc::now());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_flush.elapsed() >= interval {
            transform.flush(Utc::now(), sender.as_mut());
            *lock_state(&shared) = transform.state().clone();
            last_flush = Instant::now();
            debug!(server = transform.server(), held = transform.held(), "flush cycle");
        }
    }

    let discarded = transform.finish(Utc::now(), sender.as_mut());
    *lock_state(&shared) = transform.state().clone();
    if discarded > 0 {
        info!(
            server = transform.server(),
            discarded, "discarded lines too fresh to send on shutdown"
        );
    }
    debug!(server = transform.server(), "log collector stopped");
}
