//! Continuation reassembly.
//!
//! PostgreSQL wraps long statement text and some context blocks across
//! physical lines without repeating the prefix. Those lines are appended,
//! unchanged, to the last line that did parse.

use tracing::trace;

use crate::storage::model::{LogLevel, LogLine};

/// Append a continuation's raw text to `prev` and extend its byte range by
/// `byte_len`, the size the text occupied in its source.
pub fn append_continuation(prev: &mut LogLine, raw: &str, byte_len: i64) {
    prev.content.push_str(raw);
    prev.byte_end += byte_len;
}

/// Append `raw` to the last line of `batch`.
///
/// Returns `false` (and drops the text) when the batch is still empty.
pub fn append_to_last(batch: &mut [LogLine], raw: &str, byte_len: i64) -> bool {
    match batch.last_mut() {
        Some(prev) => {
            append_continuation(prev, raw, byte_len);
            true
        }
        None => {
            trace!(bytes = raw.len(), "dropping continuation without a preceding line");
            false
        }
    }
}

/// Merge lines that never matched a level keyword into the preceding
/// leveled line. Leading unleveled lines are dropped.
pub fn merge_unleveled(lines: Vec<LogLine>) -> Vec<LogLine> {
    let mut merged: Vec<LogLine> = Vec::with_capacity(lines.len());

    for line in lines {
        if line.log_level == LogLevel::Unknown {
            append_to_last(&mut merged, &line.content, line.byte_end - line.byte_start + 1);
        } else {
            merged.push(line);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line(level: LogLevel, content: &str, byte_start: i64) -> LogLine {
        let mut l = LogLine::new(Utc::now(), Utc::now());
        l.log_level = level;
        l.content = content.to_string();
        l.byte_start = byte_start;
        l.byte_content_start = byte_start;
        l.byte_end = byte_start + content.len() as i64 - 1;
        l
    }

    #[test]
    fn test_append_continuation() {
        let mut prev = line(LogLevel::Log, "statement: SELECT *\n", 0);
        append_continuation(&mut prev, "  FROM users\n", 13);
        assert_eq!(prev.content, "statement: SELECT *\n  FROM users\n");
        assert_eq!(prev.byte_end, 20 + 13 - 1);
    }

    #[test]
    fn test_append_uses_source_byte_length() {
        // One invalid byte in the file decoded to a 3-byte replacement char.
        let mut prev = line(LogLevel::Log, "statement: SELECT 1\n", 0);
        append_continuation(&mut prev, "  -- \u{FFFD}\n", 7);
        assert_eq!(prev.byte_end, 20 + 7 - 1);
    }

    #[test]
    fn test_append_to_empty_batch_drops() {
        let mut batch: Vec<LogLine> = Vec::new();
        assert!(!append_to_last(&mut batch, "orphan\n", 7));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_merge_unleveled() {
        let lines = vec![
            line(LogLevel::Unknown, "orphan", 0),
            line(LogLevel::Log, "statement: SELECT 1,", 6),
            line(LogLevel::Unknown, " 2,", 26),
            line(LogLevel::Unknown, " 3", 29),
            line(LogLevel::Error, "division by zero", 31),
        ];

        let merged = merge_unleveled(lines);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "statement: SELECT 1, 2, 3");
        assert_eq!(merged[1].content, "division by zero");
    }

    #[test]
    fn test_merged_byte_range_covers_all_parts() {
        let parts = ["LOG line one\n", "  continued\n", "  and again\n"];
        let mut offset = 0i64;
        let mut lines = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let level = if i == 0 { LogLevel::Log } else { LogLevel::Unknown };
            lines.push(line(level, part, offset));
            offset += part.len() as i64;
        }

        let merged = merge_unleveled(lines);
        assert_eq!(merged.len(), 1);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(
            merged[0].byte_end - merged[0].byte_start + 1,
            total as i64
        );
    }
}
