//! Backend classifier.
//!
//! Groups a batch by backend pid, links follow-on lines (DETAIL, HINT,
//! CONTEXT, STATEMENT, QUERY) to the primary line before them, classifies
//! primary lines against the rule table and derives query samples. Content
//! is cleared on every line before the batch is returned.

mod explain;
mod params;
mod rules;

use std::collections::BTreeMap;

use tracing::trace;

pub use explain::parse_auto_explain;
pub use params::parse_bind_parameters;
pub use rules::{IDENTIFY_MARKER, TRUNCATION_MARKER};

use crate::collector::log_collector::parser::strip_sqlstate;
use crate::storage::model::{LogLevel, LogLine, QuerySample};
use rules::{RuleInput, evaluate};

/// Follow-on lines considered after a primary line.
const FOLLOW_ON_WINDOW: usize = 4;

/// Classify and link an ordered batch from one server.
///
/// Line order is preserved. Samples are returned grouped by backend.
pub fn classify_and_link(mut lines: Vec<LogLine>) -> (Vec<LogLine>, Vec<QuerySample>) {
    let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (idx, line) in lines.iter().enumerate() {
        groups.entry(line.backend_pid).or_default().push(idx);
    }

    let mut consumed = vec![false; lines.len()];
    let mut samples = Vec::new();

    for group in groups.values() {
        for (pos, &primary) in group.iter().enumerate() {
            if consumed[primary] {
                continue;
            }
            let following = &group[pos + 1..];
            if let Some(sample) = classify_primary(&mut lines, &mut consumed, primary, following) {
                samples.push(sample);
            }
        }
    }

    for line in &mut lines {
        line.content.clear();
    }

    trace!(lines = lines.len(), samples = samples.len(), "classified batch");
    (lines, samples)
}

fn classify_primary(
    lines: &mut [LogLine],
    consumed: &mut [bool],
    primary: usize,
    following: &[usize],
) -> Option<QuerySample> {
    let parent = lines[primary].uuid;
    let mut follow_query: Option<String> = None;
    let mut detail: Option<usize> = None;

    for &idx in following.iter().take(FOLLOW_ON_WINDOW) {
        let level = lines[idx].log_level;
        if !level.is_follow_on() {
            break;
        }
        consumed[idx] = true;
        lines[idx].parent_uuid = Some(parent);

        match level {
            LogLevel::Statement if !is_truncated(&lines[idx].content) => {
                follow_query = Some(lines[idx].content.trim().to_string());
            }
            LogLevel::Detail if detail.is_none() => detail = Some(idx),
            _ => {}
        }
    }

    let content = lines[primary].content.trim_end();
    let input = RuleInput {
        content: strip_sqlstate(content),
        detail: detail.map(|idx| lines[idx].content.trim_end()),
        truncated: is_truncated(content),
    };
    let matched = evaluate(lines[primary].log_level, &input);

    let line = &mut lines[primary];
    if follow_query.is_some() {
        line.query = follow_query;
    }
    let m = matched?;

    line.classification = m.classification;
    line.details = m.details;
    line.related_pids = m.related_pids;
    if m.query.is_some() {
        line.query = m.query;
    }

    m.sample.map(|seed| QuerySample {
        occurred_at: line.occurred_at,
        username: line.username.clone(),
        database: line.database.clone(),
        query: seed.query,
        runtime_ms: seed.runtime_ms,
        parameters: seed.parameters,
        log_line_uuid: line.uuid,
        explain: seed.explain,
    })
}

fn is_truncated(content: &str) -> bool {
    content.contains(TRUNCATION_MARKER)
}
