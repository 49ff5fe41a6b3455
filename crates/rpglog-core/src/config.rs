//! Per-server pipeline configuration.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::collector::log_collector::parser::PrefixFormat;

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// `--server` value not in `NAME=PATH` form.
    InvalidServer(String),
    /// Timezone is not UTC, a numeric offset or an IANA zone name.
    InvalidTimezone(String),
    /// Prefix is neither a known format name nor a supported `log_line_prefix`.
    InvalidPrefix(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidServer(s) => {
                write!(f, "invalid server '{}': expected NAME=PATH", s)
            }
            ConfigError::InvalidTimezone(s) => {
                write!(
                    f,
                    "invalid timezone '{}': use UTC, an offset like +02:00 \
                     or a zone like Europe/Berlin",
                    s
                )
            }
            ConfigError::InvalidPrefix(s) => write!(f, "unsupported log_line_prefix '{}'", s),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the log pipeline needs to know about one monitored server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in logs, batch files and persisted state.
    pub name: String,
    /// Log file to tail. `None` when lines arrive from other sources only.
    pub log_path: Option<PathBuf>,
    /// Fixed prefix format. `None` enables auto-detection.
    pub prefix_format: Option<PrefixFormat>,
    /// Zone for timestamps without a numeric offset or UTC name.
    pub timezone: LogTimezone,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log_path: None,
            prefix_format: None,
            timezone: LogTimezone::default(),
        }
    }

    /// Parses a `NAME=PATH` argument.
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        let (name, path) = arg
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidServer(arg.to_string()))?;
        let name = name.trim();
        let path = path.trim();
        if name.is_empty() || path.is_empty() {
            return Err(ConfigError::InvalidServer(arg.to_string()));
        }
        let mut config = Self::new(name);
        config.log_path = Some(PathBuf::from(path));
        Ok(config)
    }
}

pub(crate) fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Zone used to interpret prefix timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTimezone {
    /// UTC or a numeric offset.
    Fixed(FixedOffset),
    /// IANA zone, daylight saving rules included.
    Named(Tz),
}

impl Default for LogTimezone {
    fn default() -> Self {
        LogTimezone::Fixed(utc_offset())
    }
}

impl std::fmt::Display for LogTimezone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogTimezone::Fixed(offset) => write!(f, "{}", offset),
            LogTimezone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

impl LogTimezone {
    /// Converts a local timestamp and its zone token (if any) to UTC.
    ///
    /// Numeric offsets and UTC names are taken as written. An abbreviation
    /// is first matched against this zone at that instant (`CEST` in
    /// `Europe/Paris`), then against the well-known abbreviations. Anything
    /// else is read as local time in this zone.
    pub fn to_utc(&self, naive: &NaiveDateTime, token: Option<&str>) -> Option<DateTime<Utc>> {
        if let Some(offset) = token.and_then(parse_zone_token) {
            return fixed_to_utc(offset, naive);
        }

        match self {
            LogTimezone::Named(tz) => {
                let candidates = match tz.from_local_datetime(naive) {
                    LocalResult::Single(dt) => vec![dt],
                    LocalResult::Ambiguous(earliest, latest) => vec![earliest, latest],
                    LocalResult::None => Vec::new(),
                };
                if let Some(token) = token
                    && let Some(dt) = candidates
                        .iter()
                        .find(|dt| dt.offset().to_string() == token)
                {
                    return Some(dt.with_timezone(&Utc));
                }
                if let Some(offset) = token.and_then(abbreviation_offset) {
                    return fixed_to_utc(offset, naive);
                }
                match candidates.first() {
                    Some(dt) => Some(dt.with_timezone(&Utc)),
                    // Skipped by a DST jump: use the offset in effect before it.
                    None => fixed_to_utc(tz.offset_from_utc_datetime(naive).fix(), naive),
                }
            }
            LogTimezone::Fixed(offset) => {
                let offset = token.and_then(abbreviation_offset).unwrap_or(*offset);
                fixed_to_utc(offset, naive)
            }
        }
    }
}

fn fixed_to_utc(offset: FixedOffset, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses a timezone setting.
///
/// Accepts `UTC`, `GMT`, `Z`, `Etc/UTC`, numeric offsets (`+02`, `+0530`,
/// `-05:00`) and IANA zone names (`Europe/Berlin`).
pub fn parse_timezone(s: &str) -> Result<LogTimezone, ConfigError> {
    let s = s.trim();
    if let Some(offset) = parse_zone_token(s) {
        return Ok(LogTimezone::Fixed(offset));
    }
    s.parse::<Tz>()
        .map(LogTimezone::Named)
        .map_err(|_| ConfigError::InvalidTimezone(s.to_string()))
}

/// Parses a UTC name or numeric offset as it appears in a timestamp.
/// `None` if unrecognized.
pub(crate) fn parse_zone_token(token: &str) -> Option<FixedOffset> {
    match token {
        "UTC" | "GMT" | "Z" | "UCT" | "Etc/UTC" | "Etc/GMT" | "Universal" => {
            return Some(utc_offset());
        }
        _ => {}
    }

    let (sign, rest) = match token.as_bytes().first()? {
        b'+' => (1, &token[1..]),
        b'-' => (-1, &token[1..]),
        _ => return None,
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (
            digits[..2].parse::<i32>().ok()?,
            digits[2..].parse::<i32>().ok()?,
        ),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Abbreviations from PostgreSQL's `Default` abbreviation set that are
/// unambiguous there, in seconds east of UTC.
const KNOWN_ABBREVIATIONS: &[(&str, i32)] = &[
    ("HST", -10 * 3600),
    ("AKST", -9 * 3600),
    ("AKDT", -8 * 3600),
    ("PST", -8 * 3600),
    ("PDT", -7 * 3600),
    ("MST", -7 * 3600),
    ("MDT", -6 * 3600),
    ("CST", -6 * 3600),
    ("CDT", -5 * 3600),
    ("EST", -5 * 3600),
    ("EDT", -4 * 3600),
    ("AST", -4 * 3600),
    ("ADT", -3 * 3600),
    ("NST", -(3 * 3600 + 1800)),
    ("NDT", -(2 * 3600 + 1800)),
    ("WET", 0),
    ("WEST", 3600),
    ("BST", 3600),
    ("CET", 3600),
    ("CEST", 2 * 3600),
    ("MET", 3600),
    ("MEST", 2 * 3600),
    ("EET", 2 * 3600),
    ("EEST", 3 * 3600),
    ("MSK", 3 * 3600),
    ("JST", 9 * 3600),
    ("KST", 9 * 3600),
    ("AWST", 8 * 3600),
    ("ACST", 9 * 3600 + 1800),
    ("ACDT", 10 * 3600 + 1800),
    ("AEST", 10 * 3600),
    ("AEDT", 11 * 3600),
    ("NZST", 12 * 3600),
    ("NZDT", 13 * 3600),
];

fn abbreviation_offset(token: &str) -> Option<FixedOffset> {
    KNOWN_ABBREVIATIONS
        .iter()
        .find(|(name, _)| *name == token)
        .and_then(|(_, secs)| FixedOffset::east_opt(*secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn fixed(tz: LogTimezone) -> i32 {
        match tz {
            LogTimezone::Fixed(offset) => offset.local_minus_utc(),
            LogTimezone::Named(tz) => panic!("expected a fixed offset, got {}", tz),
        }
    }

    #[test]
    fn test_parse_timezone_utc_names() {
        assert_eq!(fixed(parse_timezone("UTC").unwrap()), 0);
        assert_eq!(fixed(parse_timezone("Etc/UTC").unwrap()), 0);
        assert_eq!(fixed(parse_timezone(" GMT ").unwrap()), 0);
    }

    #[test]
    fn test_parse_timezone_offsets() {
        assert_eq!(fixed(parse_timezone("+02").unwrap()), 7200);
        assert_eq!(fixed(parse_timezone("+0530").unwrap()), 19800);
        assert_eq!(fixed(parse_timezone("-05:00").unwrap()), -18000);
    }

    #[test]
    fn test_parse_timezone_named_zones() {
        assert_eq!(
            parse_timezone("America/New_York").unwrap(),
            LogTimezone::Named(Tz::America__New_York)
        );
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap().to_string(),
            "Europe/Paris"
        );
    }

    #[test]
    fn test_parse_timezone_invalid() {
        assert!(parse_timezone("PST").is_err());
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("+99").is_err());
        assert!(parse_timezone("").is_err());
    }

    #[test]
    fn test_named_zone_follows_dst() {
        let tz = parse_timezone("America/New_York").unwrap();

        let summer = tz.to_utc(&naive("2020-07-01 12:00:00"), Some("EDT")).unwrap();
        assert_eq!(summer, Utc.with_ymd_and_hms(2020, 7, 1, 16, 0, 0).unwrap());
        let winter = tz.to_utc(&naive("2020-01-15 12:00:00"), Some("EST")).unwrap();
        assert_eq!(winter, Utc.with_ymd_and_hms(2020, 1, 15, 17, 0, 0).unwrap());

        // No zone token: local time in the configured zone.
        let local = tz.to_utc(&naive("2020-07-01 12:00:00"), None).unwrap();
        assert_eq!(local, summer);
    }

    #[test]
    fn test_abbreviation_picks_side_of_repeated_hour() {
        // 01:30 happens twice on 2020-11-01 in New York.
        let tz = parse_timezone("America/New_York").unwrap();
        let t = naive("2020-11-01 01:30:00");
        assert_eq!(
            tz.to_utc(&t, Some("EDT")).unwrap(),
            Utc.with_ymd_and_hms(2020, 11, 1, 5, 30, 0).unwrap()
        );
        assert_eq!(
            tz.to_utc(&t, Some("EST")).unwrap(),
            Utc.with_ymd_and_hms(2020, 11, 1, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_skipped_local_time_still_resolves() {
        // 02:30 does not exist on 2020-03-08 in New York.
        let tz = parse_timezone("America/New_York").unwrap();
        let parsed = tz.to_utc(&naive("2020-03-08 02:30:00"), None).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2020, 3, 8, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_known_abbreviation_under_other_zone() {
        let utc = LogTimezone::default();
        let cest = utc.to_utc(&naive("2020-07-01 12:00:00"), Some("CEST")).unwrap();
        assert_eq!(cest, Utc.with_ymd_and_hms(2020, 7, 1, 10, 0, 0).unwrap());

        let minus_five = parse_timezone("-05:00").unwrap();
        let edt = minus_five.to_utc(&naive("2020-07-01 12:00:00"), Some("EDT")).unwrap();
        assert_eq!(edt, Utc.with_ymd_and_hms(2020, 7, 1, 16, 0, 0).unwrap());

        // Unknown abbreviations fall back to the configured zone.
        let other = minus_five.to_utc(&naive("2020-07-01 12:00:00"), Some("XYZ")).unwrap();
        assert_eq!(other, Utc.with_ymd_and_hms(2020, 7, 1, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_server_from_arg() {
        let config = ServerConfig::from_arg("primary=/var/log/postgresql/pg.log").unwrap();
        assert_eq!(config.name, "primary");
        assert_eq!(
            config.log_path.as_deref(),
            Some(std::path::Path::new("/var/log/postgresql/pg.log"))
        );
        assert!(config.prefix_format.is_none());
    }

    #[test]
    fn test_server_from_arg_invalid() {
        assert!(ServerConfig::from_arg("primary").is_err());
        assert!(ServerConfig::from_arg("=/tmp/x.log").is_err());
        assert!(ServerConfig::from_arg("primary=").is_err());
    }
}
