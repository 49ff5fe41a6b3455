//! PostgreSQL log line prefix parser.
//!
//! Supports three fixed `log_line_prefix` layouts. When no layout is
//! configured the parser tries each of them against incoming lines and keeps
//! the first one that matches for the rest of its life.
//!
//! Lines that match no layout are not an error: they are continuations of
//! the previous line (wrapped statement text, context blocks).

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ConfigError, LogTimezone};
use crate::storage::model::{LogLevel, LogLine};

/// Level keywords as they appear in the prefix, longest alternatives first.
const LEVEL_PATTERN: &str = "DEBUG[1-5]?|INFO|NOTICE|WARNING|ERROR|LOG|FATAL|PANIC|\
    DETAIL|HINT|CONTEXT|STATEMENT|QUERY|LOCATION";

/// `%t`: second precision with zone abbreviation.
const TIMESTAMP_SECONDS: &str = r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?: [A-Za-z0-9+\-]+)?";
/// `%m`: optional millisecond fraction with zone abbreviation.
const TIMESTAMP_MILLIS: &str =
    r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?(?: [A-Za-z0-9+\-]+)?";

const LAYOUT_SECONDS: &str = "%Y-%m-%d %H:%M:%S";
const LAYOUT_MILLIS: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Placeholder PostgreSQL writes for user/database before authentication.
const UNKNOWN_PLACEHOLDER: &str = "[unknown]";

static TIME_CLIENT_USER_DB_PID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        concat!(
            r"(?s)^(?P<ts>{ts}):(?P<client>.*?):(?P<user>[^@:]*)@(?P<db>[^:]*):",
            r"\[(?P<pid>\d+)\]:(?P<level>{level}):\s\s?(?P<content>.*)$",
        ),
        ts = TIMESTAMP_SECONDS,
        level = LEVEL_PATTERN,
    ))
    .expect("valid prefix regex")
});

static TIME_PID_VXID_LINE_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        concat!(
            r"(?s)^(?P<ts>{ts}) \[(?P<pid>\d+)\]\[(?P<vxid>[^\]]*)\] : \[(?P<line>\d+)-\d+\] ",
            r"(?:\[app=(?P<app>[^\]]*)\] )?(?P<level>{level}):\s\s?(?P<content>.*)$",
        ),
        ts = TIMESTAMP_MILLIS,
        level = LEVEL_PATTERN,
    ))
    .expect("valid prefix regex")
});

static TIME_PID_LINE_USER_DB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        concat!(
            r"(?s)^(?P<ts>{ts}) \[(?P<pid>\d+)-(?P<line>\d+)\] ",
            r"(?:(?P<user>[^\s@]*)@(?P<db>\S*) )?(?P<level>{level}):\s\s?(?P<content>.*)$",
        ),
        ts = TIMESTAMP_MILLIS,
        level = LEVEL_PATTERN,
    ))
    .expect("valid prefix regex")
});

/// A supported `log_line_prefix` layout.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PrefixFormat {
    /// `%t:%r:%u@%d:[%p]:`
    TimeClientUserDbPid,
    /// `%m [%p][%v] : [%l-1] %q[app=%a] `
    TimePidVxidLineApp,
    /// `%m [%p-%l] %q%u@%d `
    TimePidLineUserDb,
}

impl PrefixFormat {
    /// Candidates in auto-detection order.
    pub const ALL: [PrefixFormat; 3] = [
        PrefixFormat::TimeClientUserDbPid,
        PrefixFormat::TimePidVxidLineApp,
        PrefixFormat::TimePidLineUserDb,
    ];

    /// The `log_line_prefix` setting this layout corresponds to.
    pub fn log_line_prefix(self) -> &'static str {
        match self {
            Self::TimeClientUserDbPid => "%t:%r:%u@%d:[%p]:",
            Self::TimePidVxidLineApp => "%m [%p][%v] : [%l-1] %q[app=%a] ",
            Self::TimePidLineUserDb => "%m [%p-%l] %q%u@%d ",
        }
    }

    /// Short name accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::TimeClientUserDbPid => "time-client-user-db-pid",
            Self::TimePidVxidLineApp => "time-pid-vxid-line-app",
            Self::TimePidLineUserDb => "time-pid-line-user-db",
        }
    }

    /// Maps a server's `log_line_prefix` to a supported layout.
    ///
    /// Trailing whitespace differences are ignored.
    pub fn from_log_line_prefix(prefix: &str) -> Option<Self> {
        let prefix = prefix.trim_end();
        Self::ALL
            .into_iter()
            .find(|f| f.log_line_prefix().trim_end() == prefix)
    }

    /// Parses a prefix setting: `auto`, a layout name, or a `log_line_prefix`.
    ///
    /// Returns `Ok(None)` for `auto`.
    pub fn from_setting(s: &str) -> Result<Option<Self>, ConfigError> {
        if s.trim() == "auto" {
            return Ok(None);
        }
        Self::ALL
            .into_iter()
            .find(|f| f.name() == s.trim())
            .or_else(|| Self::from_log_line_prefix(s))
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidPrefix(s.to_string()))
    }

    fn regex(self) -> &'static Regex {
        match self {
            Self::TimeClientUserDbPid => &TIME_CLIENT_USER_DB_PID,
            Self::TimePidVxidLineApp => &TIME_PID_VXID_LINE_APP,
            Self::TimePidLineUserDb => &TIME_PID_LINE_USER_DB,
        }
    }

    fn timestamp_layout(self) -> &'static str {
        match self {
            Self::TimeClientUserDbPid => LAYOUT_SECONDS,
            Self::TimePidVxidLineApp | Self::TimePidLineUserDb => LAYOUT_MILLIS,
        }
    }
}

impl std::fmt::Display for PrefixFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Prefix parser for one server's log stream.
///
/// Holds the detected format; once set it never changes.
pub struct PrefixParser {
    format: Option<PrefixFormat>,
    timezone: LogTimezone,
}

impl PrefixParser {
    /// Build a parser. `format = None` enables auto-detection.
    pub fn new(format: Option<PrefixFormat>, timezone: LogTimezone) -> Self {
        Self { format, timezone }
    }

    /// The fixed or detected format, if known yet.
    pub fn format(&self) -> Option<PrefixFormat> {
        self.format
    }

    /// Try to parse one physical line that starts at `byte_start`.
    ///
    /// Returns `None` when the line matches no prefix layout, which marks it
    /// as a continuation of the previous line.
    pub fn parse_line(
        &mut self,
        line: &str,
        byte_start: i64,
        collected_at: DateTime<Utc>,
    ) -> Option<LogLine> {
        if let Some(format) = self.format {
            return parse_with_format(format, line, byte_start, collected_at, self.timezone);
        }

        for format in PrefixFormat::ALL {
            if let Some(parsed) =
                parse_with_format(format, line, byte_start, collected_at, self.timezone)
            {
                info!(format = %format, "detected log_line_prefix format");
                self.format = Some(format);
                return Some(parsed);
            }
        }

        None
    }
}

fn parse_with_format(
    format: PrefixFormat,
    line: &str,
    byte_start: i64,
    collected_at: DateTime<Utc>,
    timezone: LogTimezone,
) -> Option<LogLine> {
    let caps = format.regex().captures(line)?;

    let occurred_at = parse_timestamp(
        caps.name("ts")?.as_str(),
        format.timestamp_layout(),
        timezone,
    )?;
    let log_level = LogLevel::from_keyword(caps.name("level")?.as_str())?;
    let content = caps.name("content")?;

    let mut log_line = LogLine::new(occurred_at, collected_at);
    log_line.log_level = log_level;
    log_line.backend_pid = caps
        .name("pid")
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    log_line.username = optional_field(&caps, "user");
    log_line.database = optional_field(&caps, "db");
    log_line.application = optional_field(&caps, "app");
    log_line.content = content.as_str().to_string();
    log_line.byte_start = byte_start;
    log_line.byte_content_start = byte_start + content.start() as i64;
    log_line.byte_end = byte_start + line.len() as i64 - 1;

    Some(log_line)
}

fn optional_field(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty() && *s != UNKNOWN_PLACEHOLDER)
        .map(str::to_string)
}

/// Parses a prefix timestamp (`date time [zone]`) and normalizes it to UTC.
///
/// The zone token is resolved by [`LogTimezone::to_utc`].
pub fn parse_timestamp(raw: &str, layout: &str, timezone: LogTimezone) -> Option<DateTime<Utc>> {
    let mut parts = raw.splitn(3, ' ');
    let date = parts.next()?;
    let time = parts.next()?;
    let zone = parts.next();

    let naive = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), layout).ok()?;
    timezone.to_utc(&naive, zone)
}

/// Split `LEVEL:  content` out of a line whose prefix was removed elsewhere
/// (syslog, HTTP and OTel receivers deliver content with envelope metadata).
///
/// Only the first physical line is scanned so that statement text with
/// embedded keywords is not mistaken for a level. Returns `None` when no
/// level keyword is found.
pub fn split_level(content: &str) -> Option<(LogLevel, &str)> {
    let first_line_end = content.find('\n').unwrap_or(content.len());
    let head = &content[..first_line_end];

    let mut best: Option<(usize, usize, LogLevel)> = None;
    for keyword in LEVEL_PATTERN.split('|') {
        let keyword = keyword.trim_end_matches("[1-5]?");
        let mut from = 0;
        while let Some(pos) = head[from..].find(keyword) {
            let start = from + pos;
            from = start + keyword.len();

            let preceded_ok = start == 0
                || !head.as_bytes()[start - 1].is_ascii_alphanumeric();
            if !preceded_ok {
                continue;
            }

            // DEBUG may carry a 1..5 suffix.
            let mut end = start + keyword.len();
            if keyword == "DEBUG" && head[end..].starts_with(|c: char| ('1'..='5').contains(&c)) {
                end += 1;
            }
            if !head[end..].starts_with(":  ") {
                continue;
            }

            if best.is_none_or(|(best_start, _, _)| start < best_start) {
                let level = LogLevel::from_keyword(&head[start..end])?;
                best = Some((start, end + 3, level));
            }
            break;
        }
    }

    best.map(|(_, content_start, level)| (level, &content[content_start..]))
}

/// Strip an optional SQLSTATE code from the start of a message.
///
/// With `log_error_verbosity = verbose` PostgreSQL writes `42P01: relation ...`.
pub(crate) fn strip_sqlstate(message: &str) -> &str {
    if message.len() > 7 {
        let prefix = &message.as_bytes()[..5];
        let is_sqlstate = prefix
            .iter()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            && prefix.iter().any(|c| c.is_ascii_digit());
        if is_sqlstate && message[5..].starts_with(": ") {
            return message[7..].trim_start();
        }
    }
    message
}
