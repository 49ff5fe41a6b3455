//! Dwell buffer.
//!
//! Lines are held until they are at least [`DWELL_SECS`] old so that follow-on
//! lines delivered with their own latency can still be linked to their
//! primary line. Aged lines are reassembled, classified and handed to a
//! [`BatchSender`]; on a send failure the whole input is kept for retry.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::classify::classify_and_link;
use super::reassemble::{append_to_last, merge_unleveled};
use crate::storage::model::LogLine;
use crate::storage::spool::{BatchSender, LogBatch, SendError};

/// Minimum age, in seconds, before a line is released.
pub const DWELL_SECS: i64 = 3;

/// Release aged lines from `input` and return the lines to keep holding.
///
/// - Nothing aged: `input` is returned as is.
/// - Aged lines classify to nothing: the too-fresh lines are returned.
/// - Send succeeds or collection is disabled: the too-fresh lines are returned.
/// - Send fails: the full `input` is returned.
pub fn process_log_stream(
    server: &str,
    input: Vec<LogLine>,
    now: DateTime<Utc>,
    sender: &mut dyn BatchSender,
) -> Vec<LogLine> {
    let dwell = TimeDelta::seconds(DWELL_SECS);
    let (ready, too_fresh): (Vec<LogLine>, Vec<LogLine>) = input
        .iter()
        .cloned()
        .partition(|l| now - l.collected_at >= dwell);

    if ready.is_empty() {
        return input;
    }

    let ready_count = ready.len();
    let merged = merge_unleveled(assign_stream_offsets(ready));
    let (lines, samples) = classify_and_link(merged);

    let batch = LogBatch {
        server: server.to_string(),
        created_at: now,
        lines,
        samples,
    };
    if batch.is_empty() {
        debug!(server, ready = ready_count, "nothing to send after classification");
        return too_fresh;
    }

    match sender.send(&batch) {
        Ok(()) => {
            debug!(
                server,
                lines = batch.lines.len(),
                samples = batch.samples.len(),
                held = too_fresh.len(),
                "sent log batch"
            );
            too_fresh
        }
        Err(SendError::CollectionDisabled) => {
            debug!(server, lines = batch.lines.len(), "log collection disabled, batch dropped");
            too_fresh
        }
        Err(e) => {
            warn!(server, error = %e, lines = input.len(), "failed to send log batch, will retry");
            input
        }
    }
}

/// Renumber byte offsets so that the lines form one contiguous stream.
fn assign_stream_offsets(mut lines: Vec<LogLine>) -> Vec<LogLine> {
    let mut cursor = 0i64;
    for line in &mut lines {
        let len = line.content.len() as i64;
        line.byte_start = cursor;
        line.byte_content_start = cursor;
        line.byte_end = cursor + len - 1;
        cursor += len;
    }
    lines
}

/// Per-server holding area in front of [`process_log_stream`].
pub struct LogStream {
    server: String,
    held: Vec<LogLine>,
}

impl LogStream {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            held: Vec::new(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Accepts a parsed line.
    pub fn push(&mut self, line: LogLine) {
        self.held.push(line);
    }

    /// Appends a continuation that took `byte_len` bytes in its source to
    /// the most recently accepted line.
    ///
    /// Returns `false` when nothing is held to append to.
    pub fn append_continuation(&mut self, raw: &str, byte_len: i64) -> bool {
        append_to_last(&mut self.held, raw, byte_len)
    }

    pub fn held(&self) -> &[LogLine] {
        &self.held
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Releases aged lines to `sender`.
    pub fn flush(&mut self, now: DateTime<Utc>, sender: &mut dyn BatchSender) {
        let input = std::mem::take(&mut self.held);
        self.held = process_log_stream(&self.server, input, now, sender);
    }

    /// Drops everything still held. Returns how many lines were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.held.len();
        self.held.clear();
        dropped
    }
}
