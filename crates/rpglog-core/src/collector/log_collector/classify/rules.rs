//! Ordered classification rule table.
//!
//! Every rule whose level and pattern match is applied in table order and
//! replaces the result of earlier matches, so more specific shapes are listed
//! after the generic ones they refine.

use std::sync::LazyLock;

use regex::{Captures, Match, Regex};

use super::explain::parse_auto_explain;
use super::params::parse_bind_parameters;
use crate::storage::model::{DetailValue, Details, ExplainPlan, LogClassification, LogLevel};

use LogClassification as C;

/// Appended by PostgreSQL-compatible log pipelines that cut long messages.
pub const TRUNCATION_MARKER: &str = "[Your log message was truncated]";

/// Marker a collector writes into the server log to identify itself.
pub const IDENTIFY_MARKER: &str = "rpglog-collector-identify: ";

const LOG: &[LogLevel] = &[LogLevel::Log];
const LOG_DEBUG: &[LogLevel] = &[LogLevel::Log, LogLevel::Debug];
const LOG_WARNING: &[LogLevel] = &[LogLevel::Log, LogLevel::Warning];
const LOG_FATAL: &[LogLevel] = &[LogLevel::Log, LogLevel::Fatal];
const LOG_ERROR_FATAL: &[LogLevel] = &[LogLevel::Log, LogLevel::Error, LogLevel::Fatal];
const WARNING: &[LogLevel] = &[LogLevel::Warning];
const WARNING_ERROR: &[LogLevel] = &[LogLevel::Warning, LogLevel::Error];
const ERROR: &[LogLevel] = &[LogLevel::Error];
const ERROR_FATAL: &[LogLevel] = &[LogLevel::Error, LogLevel::Fatal];
const FATAL: &[LogLevel] = &[LogLevel::Fatal];
const ANY: &[LogLevel] = &[];

/// Text a rule is evaluated against.
pub(super) struct RuleInput<'a> {
    /// Primary line content, SQLSTATE stripped.
    pub content: &'a str,
    /// Content of the first DETAIL follow-on, if any.
    pub detail: Option<&'a str>,
    /// Content carries the truncation marker.
    pub truncated: bool,
}

/// Query sample data a rule derived from the line.
#[derive(Debug)]
pub(super) struct SampleSeed {
    pub runtime_ms: f64,
    pub query: String,
    pub parameters: Vec<Option<String>>,
    pub explain: Option<ExplainPlan>,
}

/// Result of the last matching rule.
#[derive(Debug, Default)]
pub(super) struct RuleMatch {
    pub classification: LogClassification,
    pub details: Details,
    pub related_pids: Vec<i32>,
    pub query: Option<String>,
    pub sample: Option<SampleSeed>,
}

impl RuleMatch {
    fn text(&mut self, key: &str, value: Option<Match<'_>>) {
        if let Some(v) = value {
            self.details
                .insert(key.to_string(), DetailValue::Text(v.as_str().to_string()));
        }
    }

    fn int(&mut self, key: &str, value: Option<Match<'_>>) {
        if let Some(n) = value.and_then(|v| v.as_str().parse::<i64>().ok()) {
            self.details.insert(key.to_string(), DetailValue::Int(n));
        }
    }

    fn float(&mut self, key: &str, value: Option<Match<'_>>) {
        if let Some(n) = value.and_then(|v| v.as_str().parse::<f64>().ok()) {
            self.details.insert(key.to_string(), DetailValue::Float(n));
        }
    }

    fn flag(&mut self, key: &str) {
        self.details.insert(key.to_string(), DetailValue::Bool(true));
    }
}

type Extractor = fn(&Captures<'_>, &RuleInput<'_>, &mut RuleMatch);

pub(super) struct Rule {
    classification: LogClassification,
    /// Empty means any level.
    levels: &'static [LogLevel],
    pattern: Regex,
    extract: Extractor,
}

fn rule(
    classification: LogClassification,
    levels: &'static [LogLevel],
    pattern: &str,
    extract: Extractor,
) -> Rule {
    Rule {
        classification,
        levels,
        pattern: Regex::new(pattern).expect("valid classification regex"),
        extract,
    }
}

fn none(_: &Captures<'_>, _: &RuleInput<'_>, _: &mut RuleMatch) {}

/// Evaluate all rules against `input`. `None` when nothing matched.
pub(super) fn evaluate(level: LogLevel, input: &RuleInput<'_>) -> Option<RuleMatch> {
    let mut result = None;

    for rule in RULES.iter() {
        if !rule.levels.is_empty() && !rule.levels.contains(&level) {
            continue;
        }
        let Some(caps) = rule.pattern.captures(input.content) else {
            continue;
        };
        let mut m = RuleMatch {
            classification: rule.classification,
            ..Default::default()
        };
        (rule.extract)(&caps, input, &mut m);
        result = Some(m);
    }

    result
}

// ============================================================================
// Extractors shared by several rules
// ============================================================================

const LSN: &str = r"[0-9A-F]+/[0-9A-F]+";

static CHECKPOINT_STATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        concat!(
            r"wrote (\d+) buffers \(([\d.]+)%\)[^;]*; (\d+) (?:WAL|transaction log) file\(s\) ",
            r"added, (\d+) removed, (\d+) recycled; write=([\d.]+) s, sync=([\d.]+) s, total=",
            r"([\d.]+) s; sync files=(\d+), longest=([\d.]+) s, average=([\d.]+) s(?:; distance=",
            r"(\d+) kB, estimate=(\d+) kB)?",
        ),
    )
    .expect("valid checkpoint regex")
});

fn checkpoint_stats(_: &Captures<'_>, input: &RuleInput<'_>, m: &mut RuleMatch) {
    let Some(c) = CHECKPOINT_STATS.captures(input.content) else {
        return;
    };
    m.int("bufs_written", c.get(1));
    m.float("bufs_written_pct", c.get(2));
    m.int("segs_added", c.get(3));
    m.int("segs_removed", c.get(4));
    m.int("segs_recycled", c.get(5));
    m.float("write_secs", c.get(6));
    m.float("sync_secs", c.get(7));
    m.float("total_secs", c.get(8));
    m.int("sync_rels", c.get(9));
    m.float("longest_secs", c.get(10));
    m.float("average_secs", c.get(11));
    m.int("distance_kb", c.get(12));
    m.int("estimate_kb", c.get(13));
}

static VACUUM_PAGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pages: (\d+) removed, (\d+) remain").expect("valid vacuum regex")
});
static VACUUM_TUPLES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tuples: (\d+) removed, (\d+) remain, (\d+) are dead but not yet removable")
        .expect("valid vacuum regex")
});
static VACUUM_BUFFERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"buffer usage: (\d+) hits, (\d+) (?:misses|reads), (\d+) dirtied")
        .expect("valid vacuum regex")
});
static VACUUM_RATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"avg read rate: ([\d.]+) MB/s, avg write rate: ([\d.]+) MB/s")
        .expect("valid vacuum regex")
});
static VACUUM_WAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"WAL usage: (\d+) records, (\d+) full page images, (\d+) bytes")
        .expect("valid vacuum regex")
});
static SYSTEM_USAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"system usage: CPU: user: ([\d.]+) s, system: ([\d.]+) s, elapsed: ([\d.]+) s")
        .expect("valid vacuum regex")
});

fn qualified_table(c: &Captures<'_>, m: &mut RuleMatch) {
    m.text("database", c.get(1));
    m.text("schema", c.get(2));
    m.text("table", c.get(3));
}

fn system_usage(text: &str, m: &mut RuleMatch) {
    if let Some(s) = SYSTEM_USAGE.captures(text) {
        m.float("cpu_user_secs", s.get(1));
        m.float("cpu_system_secs", s.get(2));
        m.float("elapsed_secs", s.get(3));
    }
}

fn autovacuum(c: &Captures<'_>, _: &RuleInput<'_>, m: &mut RuleMatch) {
    if c.get(1).is_some() {
        m.flag("aggressive");
    }
    if c.get(2).is_some() {
        m.flag("anti_wraparound");
    }
    m.text("database", c.get(3));
    m.text("schema", c.get(4));
    m.text("table", c.get(5));
    m.int("index_scans", c.get(6));

    let stats = c.get(7).map(|s| s.as_str()).unwrap_or_default();
    if let Some(s) = VACUUM_PAGES.captures(stats) {
        m.int("pages_removed", s.get(1));
        m.int("pages_remain", s.get(2));
    }
    if let Some(s) = VACUUM_TUPLES.captures(stats) {
        m.int("tuples_removed", s.get(1));
        m.int("tuples_remain", s.get(2));
        m.int("tuples_dead_not_removable", s.get(3));
    }
    if let Some(s) = VACUUM_BUFFERS.captures(stats) {
        m.int("buffer_hits", s.get(1));
        m.int("buffer_misses", s.get(2));
        m.int("buffer_dirtied", s.get(3));
    }
    if let Some(s) = VACUUM_RATES.captures(stats) {
        m.float("read_rate_mbps", s.get(1));
        m.float("write_rate_mbps", s.get(2));
    }
    if let Some(s) = VACUUM_WAL.captures(stats) {
        m.int("wal_records", s.get(1));
        m.int("wal_fpi", s.get(2));
        m.int("wal_bytes", s.get(3));
    }
    system_usage(stats, m);
}

fn autoanalyze(c: &Captures<'_>, _: &RuleInput<'_>, m: &mut RuleMatch) {
    qualified_table(c, m);
    system_usage(c.get(4).map(|s| s.as_str()).unwrap_or_default(), m);
}

static LOCK_QUEUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Process(?:es)? holding the lock: ([\d, ]+)\. Wait queue: ([\d, ]*)")
        .expect("valid lock regex")
});

fn pid_list(text: &str) -> Vec<i64> {
    text.split(',')
        .filter_map(|p| p.trim().parse::<i64>().ok())
        .collect()
}

fn lock_mode(c: &Captures<'_>, m: &mut RuleMatch) {
    m.text("lock_mode", c.get(2));
    m.text("lock_type", c.get(3));
    m.text("lock_object", c.get(4));
    m.float("wait_ms", c.get(5));
}

fn lock_waiting(c: &Captures<'_>, input: &RuleInput<'_>, m: &mut RuleMatch) {
    lock_mode(c, m);

    let Some(queue) = input.detail.and_then(|d| LOCK_QUEUE.captures(d)) else {
        return;
    };
    let holders = pid_list(queue.get(1).map(|g| g.as_str()).unwrap_or_default());
    let waiters = pid_list(queue.get(2).map(|g| g.as_str()).unwrap_or_default());

    m.related_pids = holders
        .iter()
        .chain(waiters.iter())
        .filter_map(|&pid| i32::try_from(pid).ok())
        .collect();
    m.details
        .insert("lock_holders".to_string(), DetailValue::IntList(holders));
    m.details
        .insert("lock_waiters".to_string(), DetailValue::IntList(waiters));
}

static DEADLOCK_PIDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)process (\d+)").expect("valid deadlock regex"));

fn deadlock(_: &Captures<'_>, input: &RuleInput<'_>, m: &mut RuleMatch) {
    let Some(detail) = input.detail else {
        return;
    };
    for c in DEADLOCK_PIDS.captures_iter(detail) {
        if let Some(pid) = c.get(1).and_then(|p| p.as_str().parse::<i32>().ok()) {
            if !m.related_pids.contains(&pid) {
                m.related_pids.push(pid);
            }
        }
    }
}

fn disconnection(c: &Captures<'_>, _: &RuleInput<'_>, m: &mut RuleMatch) {
    let parts = (
        c.get(1).and_then(|h| h.as_str().parse::<f64>().ok()),
        c.get(2).and_then(|h| h.as_str().parse::<f64>().ok()),
        c.get(3).and_then(|h| h.as_str().parse::<f64>().ok()),
    );
    if let (Some(h), Some(min), Some(s)) = parts {
        m.details.insert(
            "session_time_secs".to_string(),
            DetailValue::Float(h * 3600.0 + min * 60.0 + s),
        );
    }
    m.text("user", c.get(4));
    m.text("database", c.get(5));
    m.text("host", c.get(6));
    m.int("port", c.get(7));
}

fn statement_duration(c: &Captures<'_>, input: &RuleInput<'_>, m: &mut RuleMatch) {
    if input.truncated {
        m.flag("truncated");
        return;
    }

    let Some(kind) = c.get(2).map(|k| k.as_str()) else {
        return;
    };
    let query = c.get(4).map(|q| q.as_str().trim()).unwrap_or_default();
    if query.is_empty() {
        return;
    }
    m.query = Some(query.to_string());

    // Bind/parse durations repeat the query of the following execute.
    if kind == "bind" || kind == "parse" {
        return;
    }
    let Some(runtime_ms) = c.get(1).and_then(|r| r.as_str().parse::<f64>().ok()) else {
        return;
    };
    let parameters = input
        .detail
        .and_then(parse_bind_parameters)
        .unwrap_or_default();

    m.sample = Some(SampleSeed {
        runtime_ms,
        query: query.to_string(),
        parameters,
        explain: None,
    });
}

fn statement_log(c: &Captures<'_>, _: &RuleInput<'_>, m: &mut RuleMatch) {
    let query = c.get(3).map(|q| q.as_str().trim()).unwrap_or_default();
    if !query.is_empty() {
        m.query = Some(query.to_string());
    }
}

fn auto_explain(c: &Captures<'_>, input: &RuleInput<'_>, m: &mut RuleMatch) {
    let parsed = if input.truncated {
        None
    } else {
        c.get(2).and_then(|p| parse_auto_explain(p.as_str()))
    };
    let (Some((query, explain)), Some(runtime_ms)) = (
        parsed,
        c.get(1).and_then(|r| r.as_str().parse::<f64>().ok()),
    ) else {
        m.flag("truncated");
        return;
    };

    m.query = Some(query.clone());
    m.sample = Some(SampleSeed {
        runtime_ms,
        query,
        parameters: Vec::new(),
        explain: Some(explain),
    });
}

// ============================================================================
// Rule table
// ============================================================================

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Connections
        rule(
            C::ConnectionReceived,
            LOG,
            r"^connection received: host=(\S+)(?: port=(\d+))?",
            |c, _, m| {
                m.text("host", c.get(1));
                m.int("port", c.get(2));
            },
        ),
        rule(
            C::ConnectionAuthorized,
            LOG,
            concat!(
                r"^(?:replication )?connection authorized: user=(\S+)(?: database=(\S+))?(?: ",
                r"application_name=(\S+))?(?: SSL enabled \(protocol=([^,]+), cipher=([^,)]+)(?:, ",
                r"bits=(\d+))?)?",
            ),
            |c, _, m| {
                m.text("user", c.get(1));
                m.text("database", c.get(2));
                m.text("application_name", c.get(3));
                m.text("ssl_protocol", c.get(4));
                m.text("ssl_cipher", c.get(5));
                m.int("ssl_bits", c.get(6));
            },
        ),
        rule(
            C::ConnectionRejected,
            FATAL,
            r#"^password authentication failed for user "(.+?)""#,
            |c, _, m| {
                m.text("role", c.get(1))
            },
        ),
        rule(
            C::ConnectionRejected,
            FATAL,
            concat!(
                r#"^(?:no pg_hba\.conf entry|pg_hba\.conf rejects connection) for host "(.+?)", "#,
                r#"user "(.+?)", database "(.+?)""#,
            ),
            |c, _, m| {
                m.text("host", c.get(1));
                m.text("role", c.get(2));
                m.text("database", c.get(3));
            },
        ),
        rule(C::ConnectionRejected, FATAL, r#"^role "(.+?)" does not exist"#, |c, _, m| {
            m.text("role", c.get(1));
        }),
        rule(
            C::ConnectionRejected,
            FATAL,
            r#"^role "(.+?)" is not permitted to log in"#,
            |c, _, m| {
                m.text("role", c.get(1));
            },
        ),
        rule(C::ConnectionRejected, FATAL, r#"^database "(.+?)" does not exist"#, |c, _, m| {
            m.text("database", c.get(1));
        }),
        rule(
            C::ConnectionDisconnected,
            LOG,
            concat!(
                r"^disconnection: session time: (\d+):(\d+):([\d.]+) user=(\S+) database=(\S+) ",
                r"host=(\S+)(?: port=(\d+))?",
            ),
            disconnection,
        ),
        rule(C::ConnectionClientFailedToConnect, LOG, r"^incomplete startup packet", none),
        rule(
            C::ConnectionLost,
            LOG_ERROR_FATAL,
            r"^could not (?:receive data from|send data to) client: (.+)",
            |c, _, m| m.text("reason", c.get(1)),
        ),
        rule(C::ConnectionLost, LOG_ERROR_FATAL, r"^connection to client lost", none),
        rule(C::ConnectionLost, LOG_FATAL, r"^unexpected EOF on client connection", none),
        rule(
            C::ConnectionLostOpenTx,
            LOG_FATAL,
            r"^unexpected EOF on client connection with an open transaction",
            none,
        ),
        rule(
            C::ConnectionTerminated,
            FATAL,
            concat!(
                r"^terminating connection due to (administrator command|idle-in-transaction ",
                r"timeout|idle-session timeout)",
            ),
            |c, _, m| m.text("reason", c.get(1)),
        ),
        rule(
            C::OutOfConnections,
            FATAL,
            r"^(?:sorry, too many clients already|remaining connection slots are reserved)",
            none,
        ),
        rule(
            C::TooManyConnectionsRole,
            FATAL,
            r#"^too many connections for role "(.+?)""#,
            |c, _, m| {
                m.text("role", c.get(1))
            },
        ),
        rule(
            C::TooManyConnectionsDatabase,
            FATAL,
            r#"^too many connections for database "(.+?)""#,
            |c, _, m| m.text("database", c.get(1)),
        ),
        rule(
            C::CouldNotAcceptSslConnection,
            LOG_FATAL,
            r"^could not accept SSL connection: (.+)",
            |c, _, m| m.text("reason", c.get(1)),
        ),
        rule(
            C::ProtocolErrorUnsupportedVersion,
            FATAL,
            r"^unsupported frontend protocol (\d+\.\d+)",
            |c, _, m| m.text("protocol_version", c.get(1)),
        ),
        rule(
            C::ProtocolErrorIncompleteMessage,
            LOG_FATAL,
            r"^incomplete message from client",
            none,
        ),
        // Checkpointer
        rule(C::CheckpointStarting, LOG, r"^checkpoint starting: (.+)", |c, _, m| {
            m.text("reason", c.get(1))
        }),
        rule(C::CheckpointComplete, LOG, r"^checkpoint complete: ", checkpoint_stats),
        rule(
            C::CheckpointTooFrequent,
            LOG,
            r"^checkpoints are occurring too frequently \((\d+) seconds? apart\)",
            |c, _, m| m.int("seconds_apart", c.get(1)),
        ),
        rule(C::RestartpointStarting, LOG, r"^restartpoint starting: (.+)", |c, _, m| {
            m.text("reason", c.get(1))
        }),
        rule(C::RestartpointComplete, LOG, r"^restartpoint complete: ", checkpoint_stats),
        rule(
            C::RestartpointAt,
            LOG,
            &format!(r"^recovery restart point at ({LSN})"),
            |c, _, m| m.text("lsn", c.get(1)),
        ),
        // WAL
        rule(
            C::WalInvalidRecordLength,
            LOG,
            &format!(r"^invalid record length at ({LSN})"),
            |c, _, m| m.text("lsn", c.get(1)),
        ),
        rule(C::WalRedo, LOG, &format!(r"^redo (starts|done) at ({LSN})"), |c, _, m| {
            m.text("phase", c.get(1));
            m.text("lsn", c.get(2));
        }),
        rule(
            C::WalArchiveCommandFailed,
            LOG_WARNING,
            r"^archive command failed with exit code (\d+)",
            |c, _, m| m.int("exit_code", c.get(1)),
        ),
        rule(
            C::WalArchiveCommandFailed,
            WARNING,
            r#"^archiving (?:write-ahead log|transaction log) file "(.+?)" failed too many times"#,
            |c, _, m| m.text("file", c.get(1)),
        ),
        rule(
            C::WalBaseBackupComplete,
            LOG_WARNING,
            concat!(
                r"^(?:pg_stop_backup|pg_backup_stop) complete, all required WAL segments have ",
                r"been archived",
            ),
            none,
        ),
        // Locks
        rule(
            C::LockAcquired,
            LOG,
            r"^process (\d+) acquired (\w+) on (\w+) (.+?) after ([\d.]+) ms",
            |c, _, m| lock_mode(c, m),
        ),
        rule(
            C::LockWaiting,
            LOG,
            r"^process (\d+) still waiting for (\w+) on (\w+) (.+?) after ([\d.]+) ms",
            lock_waiting,
        ),
        rule(C::LockTimeout, ERROR, r"^canceling statement due to lock timeout", none),
        rule(C::LockDeadlockDetected, ERROR, r"^deadlock detected", deadlock),
        rule(
            C::LockDeadlockAvoided,
            LOG,
            concat!(
                r"^process (\d+) avoided deadlock for (\w+) on (\w+) (.+?) by rearranging queue ",
                r"order after ([\d.]+) ms",
            ),
            |c, _, m| lock_mode(c, m),
        ),
        // Statements
        rule(
            C::StatementDuration,
            LOG,
            concat!(
                r"(?s)^duration: ([\d.]+) ms(?:\s+(statement|execute|parse|bind)(?: ([^:]*))?: ",
                r"(.*))?\s*$",
            ),
            statement_duration,
        ),
        rule(
            C::StatementCanceledTimeout,
            ERROR,
            r"^canceling statement due to statement timeout",
            none,
        ),
        rule(C::StatementCanceledUser, ERROR, r"^canceling statement due to user request", none),
        rule(
            C::StatementLog,
            LOG,
            r"(?s)^(statement|execute|parse|bind)(?: ([^:]*))?: (.*)$",
            statement_log,
        ),
        rule(
            C::StatementAutoExplain,
            LOG,
            r"(?s)^duration: ([\d.]+) ms\s+plan:\s*(.*)$",
            auto_explain,
        ),
        // Autovacuum
        rule(C::AutovacuumCancel, ERROR, r"^canceling autovacuum task", none),
        rule(
            C::TxidWraparoundWarning,
            WARNING,
            r#"^database (?:with OID (\d+)|"(.+?)") must be vacuumed within (\d+) transactions"#,
            |c, _, m| {
                m.int("database_oid", c.get(1));
                m.text("database", c.get(2));
                m.int("remaining_xids", c.get(3));
            },
        ),
        rule(
            C::TxidWraparoundError,
            ERROR,
            concat!(
                r#"^database is not accepting commands to avoid wraparound data loss in database "#,
                r#"(?:with OID (\d+)|"(.+?)")"#,
            ),
            |c, _, m| {
                m.int("database_oid", c.get(1));
                m.text("database", c.get(2));
            },
        ),
        rule(C::AutovacuumLauncherStarted, LOG_DEBUG, r"^autovacuum launcher started", none),
        rule(
            C::AutovacuumLauncherShuttingDown,
            LOG_DEBUG,
            r"^autovacuum launcher shutting down",
            none,
        ),
        rule(
            C::AutovacuumCompleted,
            LOG,
            concat!(
                r#"(?s)^automatic (aggressive )?vacuum (to prevent wraparound )?of table ""#,
                r#"([^"]+?)\.([^"]+?)\.([^"]+)": index scans: (\d+)(.*)$"#,
            ),
            autovacuum,
        ),
        rule(
            C::AutoanalyzeCompleted,
            LOG,
            r#"(?s)^automatic analyze of table "([^"]+?)\.([^"]+?)\.([^"]+)"(.*)$"#,
            autoanalyze,
        ),
        rule(
            C::SkippingVacuumLockNotAvailable,
            LOG,
            r#"^skipping vacuum of "(.+?)" --- lock not available"#,
            |c, _, m| m.text("table", c.get(1)),
        ),
        rule(
            C::SkippingAnalyzeLockNotAvailable,
            LOG,
            r#"^skipping analyze of "(.+?)" --- lock not available"#,
            |c, _, m| m.text("table", c.get(1)),
        ),
        // Server
        rule(
            C::ServerCrashed,
            LOG,
            r"^(.+?) \(PID (\d+)\) was terminated by (?:signal|exception) (\w+)",
            |c, _, m| {
                m.text("process_type", c.get(1));
                m.int("process_pid", c.get(2));
                m.text("signal", c.get(3));
                if let Some(pid) = c.get(2).and_then(|p| p.as_str().parse().ok()) {
                    m.related_pids.push(pid);
                }
            },
        ),
        rule(
            C::ServerCrashed,
            LOG_WARNING,
            r"^terminating any other active server processes",
            none,
        ),
        rule(C::ServerCrashed, LOG, r"^all server processes terminated; reinitializing", none),
        rule(
            C::ServerProcessExited,
            LOG,
            r"^(.+?) \(PID (\d+)\) exited with exit code (\d+)",
            |c, _, m| {
                m.text("process_type", c.get(1));
                m.int("process_pid", c.get(2));
                m.int("exit_code", c.get(3));
                if let Some(pid) = c.get(2).and_then(|p| p.as_str().parse().ok()) {
                    m.related_pids.push(pid);
                }
            },
        ),
        rule(
            C::ServerStart,
            LOG,
            r"^database system is ready to accept (?:read[- ]only )?connections",
            none,
        ),
        rule(
            C::ServerStart,
            LOG,
            r"^database system was shut down(?: in recovery)? at (.+)",
            |c, _, m| {
                m.text("shutdown_at", c.get(1))
            },
        ),
        rule(
            C::ServerStartRecovering,
            LOG,
            r"^database system was interrupted(?: while in recovery)?(?:; last known up at (.+))?",
            |c, _, m| m.text("last_up_at", c.get(1)),
        ),
        rule(
            C::ServerStartRecovering,
            LOG,
            r"^database system was not properly shut down; automatic recovery in progress",
            none,
        ),
        rule(
            C::ServerShutdown,
            LOG,
            r"^received (smart|fast|immediate) shutdown request",
            |c, _, m| m.text("mode", c.get(1)),
        ),
        rule(
            C::ServerShutdown,
            LOG,
            r"^(?:database system is shut down|shutting down|aborting any active transactions)",
            none,
        ),
        rule(C::ServerOutOfMemory, ERROR_FATAL, r"^out of memory", none),
        rule(
            C::ServerOutOfMemory,
            LOG,
            concat!(
                r"^could not fork (?:new process for connection|worker process): Cannot allocate ",
                r"memory",
            ),
            none,
        ),
        rule(
            C::ServerInvalidChecksum,
            WARNING_ERROR,
            r"^page verification failed, calculated checksum (\d+) but expected (\d+)",
            |c, _, m| {
                m.int("calculated_checksum", c.get(1));
                m.int("expected_checksum", c.get(2));
            },
        ),
        rule(
            C::ServerInvalidChecksum,
            WARNING_ERROR,
            r"^invalid page in block (\d+) of relation (\S+)",
            |c, _, m| {
                m.int("block", c.get(1));
                m.text("file", c.get(2));
            },
        ),
        rule(C::ServerReload, LOG, r"^received SIGHUP, reloading configuration files", none),
        rule(C::ServerReload, LOG, r#"^parameter "(.+?)" changed to "(.*)""#, |c, _, m| {
            m.text("parameter", c.get(1));
            m.text("value", c.get(2));
        }),
        rule(
            C::ServerTempFileCreated,
            LOG,
            r#"^temporary file: path "(.+?)", size (\d+)"#,
            |c, _, m| {
                m.text("file", c.get(1));
                m.int("size", c.get(2));
            },
        ),
        rule(
            C::ServerMisc,
            LOG_WARNING,
            concat!(
                r"^(?:pg_hba\.conf was not reloaded|pg_ident\.conf was not reloaded|could not ",
                r"open usermap file|using stale statistics instead of current ones)",
            ),
            none,
        ),
        // Standby
        rule(
            C::StandbyRestoredWalFromArchive,
            LOG,
            r#"^restored log file "(.+?)" from archive"#,
            |c, _, m| m.text("file", c.get(1)),
        ),
        rule(
            C::StandbyStartedStreaming,
            LOG,
            &format!(r"^started streaming WAL from primary at ({LSN}) on timeline (\d+)"),
            |c, _, m| {
                m.text("lsn", c.get(1));
                m.int("timeline", c.get(2));
            },
        ),
        rule(
            C::StandbyStreamingInterrupted,
            LOG_FATAL,
            r"^could not receive data from WAL stream: (.+)",
            |c, _, m| m.text("reason", c.get(1)),
        ),
        rule(
            C::StandbyStreamingInterrupted,
            LOG_FATAL,
            r"^replication terminated by primary server",
            none,
        ),
        rule(
            C::StandbyStoppedStreaming,
            LOG_FATAL,
            r"^terminating walreceiver process due to administrator command",
            none,
        ),
        rule(
            C::StandbyConsistentRecoveryState,
            LOG,
            &format!(r"^consistent recovery state reached at ({LSN})"),
            |c, _, m| m.text("lsn", c.get(1)),
        ),
        rule(
            C::StandbyStatementCanceled,
            ERROR_FATAL,
            r"^(?:canceling statement|terminating connection) due to conflict with recovery",
            none,
        ),
        rule(
            C::StandbyInvalidTimeline,
            LOG_FATAL,
            r"^requested timeline (\d+) is not a child of this server's history",
            |c, _, m| m.int("timeline", c.get(1)),
        ),
        rule(
            C::StandbyInvalidTimeline,
            LOG_FATAL,
            r"^new timeline (\d+) is not a child of database system timeline (\d+)",
            |c, _, m| m.int("timeline", c.get(1)),
        ),
        // Constraint violations
        rule(
            C::UniqueConstraintViolation,
            ERROR,
            r#"^duplicate key value violates unique constraint "(.+?)""#,
            |c, _, m| m.text("constraint_name", c.get(1)),
        ),
        rule(
            C::ForeignKeyConstraintViolation,
            ERROR,
            concat!(
                r#"^(?:insert or update|update or delete) on table "(.+?)" violates foreign key "#,
                r#"constraint "(.+?)""#,
            ),
            |c, _, m| {
                m.text("table", c.get(1));
                m.text("constraint_name", c.get(2));
            },
        ),
        rule(
            C::NotNullConstraintViolation,
            ERROR,
            concat!(
                r#"^null value in column "(.+?)"(?: of relation "(.+?)")? violates not-null "#,
                r#"constraint"#,
            ),
            |c, _, m| {
                m.text("column", c.get(1));
                m.text("table", c.get(2));
            },
        ),
        rule(
            C::CheckConstraintViolation,
            ERROR,
            r#"^new row for relation "(.+?)" violates check constraint "(.+?)""#,
            |c, _, m| {
                m.text("table", c.get(1));
                m.text("constraint_name", c.get(2));
            },
        ),
        rule(
            C::CheckConstraintViolation,
            ERROR,
            r#"^check constraint "(.+?)" (?:of relation "(.+?)" )?is violated by some row"#,
            |c, _, m| {
                m.text("constraint_name", c.get(1));
                m.text("table", c.get(2));
            },
        ),
        rule(
            C::ExclusionConstraintViolation,
            ERROR,
            r#"^conflicting key value violates exclusion constraint "(.+?)""#,
            |c, _, m| m.text("constraint_name", c.get(1)),
        ),
        // Query errors
        rule(
            C::SyntaxError,
            ERROR,
            r#"^syntax error at (?:or near "(.*?)"|end of input)"#,
            |c, _, m| m.text("near", c.get(1)),
        ),
        rule(
            C::InvalidInputSyntax,
            ERROR,
            r"^invalid input syntax for (?:type )?([^:]+):",
            |c, _, m| {
                m.text("data_type", c.get(1))
            },
        ),
        rule(C::ValueTooLongForType, ERROR, r"^value too long for type (.+)", |c, _, m| {
            m.text("data_type", c.get(1))
        }),
        rule(C::InvalidValue, ERROR, r#"^invalid value ".*?" for "(.+?)""#, |c, _, m| {
            m.text("field", c.get(1))
        }),
        rule(C::MalformedArrayLiteral, ERROR, r"^malformed array literal:", none),
        rule(C::SubqueryMissingAlias, ERROR, r"^subquery in FROM must have an alias", none),
        rule(
            C::InsertTargetColumnMismatch,
            ERROR,
            r"^INSERT has more (?:target columns than expressions|expressions than target columns)",
            none,
        ),
        rule(
            C::AnyAllRequiresArray,
            ERROR,
            r"^op ANY/ALL \(array\) requires array on right side",
            none,
        ),
        rule(
            C::ColumnMissingFromGroupBy,
            ERROR,
            concat!(
                r#"^column "(.+?)" must appear in the GROUP BY clause or be used in an aggregate "#,
                r#"function"#,
            ),
            |c, _, m| m.text("column", c.get(1)),
        ),
        rule(C::RelationDoesNotExist, ERROR, r#"^relation "(.+?)" does not exist"#, |c, _, m| {
            m.text("relation", c.get(1))
        }),
        rule(
            C::ColumnDoesNotExist,
            ERROR,
            r#"^column "?(.+?)"?(?: of relation "(.+?)")? does not exist"#,
            |c, _, m| {
                m.text("column", c.get(1));
                m.text("relation", c.get(2));
            },
        ),
        rule(C::OperatorDoesNotExist, ERROR, r"^operator does not exist: (.+)", |c, _, m| {
            m.text("operator", c.get(1))
        }),
        rule(
            C::ColumnReferenceAmbiguous,
            ERROR,
            r#"^column reference "(.+?)" is ambiguous"#,
            |c, _, m| m.text("column", c.get(1)),
        ),
        rule(C::PermissionDenied, ERROR, r"^permission denied for (\w+) (.+)", |c, _, m| {
            m.text("object_type", c.get(1));
            m.text("object_name", c.get(2));
        }),
        rule(C::PermissionDenied, ERROR, r"^must be owner of (\w+) (.+)", |c, _, m| {
            m.text("object_type", c.get(1));
            m.text("object_name", c.get(2));
        }),
        rule(
            C::TransactionIsAborted,
            ERROR,
            r"^current transaction is aborted, commands ignored until end of transaction block",
            none,
        ),
        rule(
            C::OnConflictNoConstraintMatch,
            ERROR,
            r"^there is no unique or exclusion constraint matching the ON CONFLICT specification",
            none,
        ),
        rule(
            C::OnConflictRowAffectedTwice,
            ERROR,
            r"^ON CONFLICT DO UPDATE command cannot affect row a second time",
            none,
        ),
        rule(
            C::ColumnCannotBeCast,
            ERROR,
            r#"^column "(.+?)" cannot be cast (?:automatically )?to type (.+)"#,
            |c, _, m| {
                m.text("column", c.get(1));
                m.text("data_type", c.get(2));
            },
        ),
        rule(C::DivisionByZero, ERROR, r"^division by zero", none),
        rule(
            C::CannotDrop,
            ERROR,
            r"^cannot drop (.+?) because other objects depend on it",
            |c, _, m| m.text("object", c.get(1)),
        ),
        rule(C::IntegerOutOfRange, ERROR, r"^(?:integer|smallint|bigint) out of range", none),
        rule(C::InvalidRegexp, ERROR, r"^invalid regular expression: (.+)", |c, _, m| {
            m.text("reason", c.get(1))
        }),
        rule(C::ParamMissing, ERROR, r"^there is no parameter \$(\d+)", |c, _, m| {
            m.int("parameter", c.get(1))
        }),
        rule(C::FunctionDoesNotExist, ERROR, r"^function (.+?) does not exist", |c, _, m| {
            m.text("function", c.get(1))
        }),
        rule(
            C::NoSuchSavepoint,
            ERROR,
            r#"^(?:no such savepoint|savepoint "(.+?)" does not exist)"#,
            |c, _, m| m.text("savepoint", c.get(1)),
        ),
        rule(
            C::UnterminatedQuotedString,
            ERROR,
            r"^unterminated quoted string at or near",
            none,
        ),
        rule(
            C::UnterminatedQuotedIdentifier,
            ERROR,
            r"^unterminated quoted identifier at or near",
            none,
        ),
        rule(
            C::InvalidByteSequence,
            ERROR,
            r#"^invalid byte sequence for encoding "(.+?)""#,
            |c, _, m| m.text("encoding", c.get(1)),
        ),
        rule(
            C::CouldNotSerializeRepeatableRead,
            ERROR,
            r"^could not serialize access due to concurrent (?:update|delete)",
            none,
        ),
        rule(
            C::CouldNotSerializeSerializable,
            ERROR,
            r"^could not serialize access due to read/write dependencies among transactions",
            none,
        ),
        rule(
            C::InconsistentRangeBounds,
            ERROR,
            r"^range lower bound must be less than or equal to range upper bound",
            none,
        ),
        // Identify marker
        rule(
            C::CollectorIdentify,
            ANY,
            &format!(r"{}(\S+)", regex::escape(IDENTIFY_MARKER)),
            |c, _, m| m.text("config_section", c.get(1)),
        ),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(level: LogLevel, content: &str) -> Option<RuleMatch> {
        evaluate(
            level,
            &RuleInput {
                content,
                detail: None,
                truncated: content.contains(TRUNCATION_MARKER),
            },
        )
    }

    fn classify(level: LogLevel, content: &str) -> LogClassification {
        eval(level, content)
            .map(|m| m.classification)
            .unwrap_or_default()
    }

    #[test]
    fn test_table_compiles() {
        assert!(RULES.len() > 90);
    }

    #[test]
    fn test_empty_content_never_matches() {
        for level in [
            LogLevel::Log,
            LogLevel::Error,
            LogLevel::Fatal,
            LogLevel::Warning,
            LogLevel::Unknown,
        ] {
            assert!(eval(level, "").is_none());
        }
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(
            classify(LogLevel::Fatal, "role \"bob\" does not exist"),
            LogClassification::ConnectionRejected
        );
        assert_eq!(
            classify(LogLevel::Log, "role \"bob\" does not exist"),
            LogClassification::Unknown
        );
    }

    #[test]
    fn test_later_match_wins() {
        assert_eq!(
            classify(LogLevel::Log, "unexpected EOF on client connection"),
            LogClassification::ConnectionLost
        );
        assert_eq!(
            classify(
                LogLevel::Log,
                "unexpected EOF on client connection with an open transaction"
            ),
            LogClassification::ConnectionLostOpenTx
        );
    }

    #[test]
    fn test_connection_authorized_details() {
        let m = eval(
            LogLevel::Log,
            "connection authorized: user=app database=shop application_name=psql SSL enabled \
             (protocol=TLSv1.3, cipher=TLS_AES_256_GCM_SHA384, bits=256)",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::ConnectionAuthorized);
        assert_eq!(m.details["user"], DetailValue::Text("app".into()));
        assert_eq!(m.details["database"], DetailValue::Text("shop".into()));
        assert_eq!(m.details["ssl_protocol"], DetailValue::Text("TLSv1.3".into()));
        assert_eq!(m.details["ssl_bits"], DetailValue::Int(256));
    }

    #[test]
    fn test_disconnection_session_time() {
        let m = eval(
            LogLevel::Log,
            "disconnection: session time: 0:01:02.500 user=app database=shop host=10.0.0.1 \
             port=5432",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::ConnectionDisconnected);
        assert_eq!(m.details["session_time_secs"], DetailValue::Float(62.5));
        assert_eq!(m.details["port"], DetailValue::Int(5432));
    }

    #[test]
    fn test_checkpoint_complete() {
        let m = eval(
            LogLevel::Log,
            "checkpoint complete: wrote 2 buffers (0.0%); 0 WAL file(s) added, 0 removed, 1 \
             recycled; write=0.101 s, sync=0.002 s, total=0.108 s; sync files=2, longest=0.001 s, \
             average=0.001 s; distance=16384 kB, estimate=16384 kB",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::CheckpointComplete);
        assert_eq!(m.details["bufs_written"], DetailValue::Int(2));
        assert_eq!(m.details["segs_recycled"], DetailValue::Int(1));
        assert_eq!(m.details["total_secs"], DetailValue::Float(0.108));
        assert_eq!(m.details["distance_kb"], DetailValue::Int(16384));
    }

    #[test]
    fn test_unparsable_field_is_omitted() {
        let m = eval(LogLevel::Fatal, "too many connections for database \"shop\"").unwrap();
        assert_eq!(m.classification, LogClassification::TooManyConnectionsDatabase);
        assert_eq!(m.details.len(), 1);

        // Out-of-range integer: classified, field dropped.
        let m = eval(
            LogLevel::Log,
            "checkpoints are occurring too frequently (99999999999999999999 seconds apart)",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::CheckpointTooFrequent);
        assert!(m.details.is_empty());
    }

    #[test]
    fn test_autovacuum_details() {
        let content = "automatic vacuum of table \"shop.public.orders\": index scans: 1\n\tpages: \
                       0 removed, 42 remain, 0 skipped due to pins, 0 skipped frozen\n\ttuples: \
                       10 removed, 900 remain, 3 are dead but not yet removable\n\tbuffer usage: \
                       120 hits, 4 misses, 7 dirtied\n\tavg read rate: 1.250 MB/s, avg write \
                       rate: 2.500 MB/s\n\tsystem usage: CPU: user: 0.01 s, system: 0.00 s, \
                       elapsed: 0.02 s";
        let m = eval(LogLevel::Log, content).unwrap();
        assert_eq!(m.classification, LogClassification::AutovacuumCompleted);
        assert_eq!(m.details["table"], DetailValue::Text("orders".into()));
        assert_eq!(m.details["schema"], DetailValue::Text("public".into()));
        assert_eq!(m.details["tuples_removed"], DetailValue::Int(10));
        assert_eq!(m.details["buffer_misses"], DetailValue::Int(4));
        assert_eq!(m.details["write_rate_mbps"], DetailValue::Float(2.5));
        assert_eq!(m.details["elapsed_secs"], DetailValue::Float(0.02));
        assert!(!m.details.contains_key("aggressive"));
    }

    #[test]
    fn test_server_crashed_related_pid() {
        let m = eval(
            LogLevel::Log,
            "server process (PID 4242) was terminated by signal 9: Killed",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::ServerCrashed);
        assert_eq!(m.related_pids, vec![4242]);
        assert_eq!(m.details["signal"], DetailValue::Text("9".into()));
    }

    #[test]
    fn test_query_errors() {
        let cases = [
            (
                "duplicate key value violates unique constraint \"users_pkey\"",
                C::UniqueConstraintViolation,
            ),
            ("relation \"missing\" does not exist", C::RelationDoesNotExist),
            (
                "column \"foo\" of relation \"bar\" does not exist",
                C::ColumnDoesNotExist,
            ),
            ("column t.foo does not exist", C::ColumnDoesNotExist),
            ("function foo(integer) does not exist", C::FunctionDoesNotExist),
            ("syntax error at or near \"SELEC\"", C::SyntaxError),
            ("division by zero", C::DivisionByZero),
            (
                "canceling statement due to statement timeout",
                C::StatementCanceledTimeout,
            ),
            (
                "canceling statement due to conflict with recovery",
                C::StandbyStatementCanceled,
            ),
            (
                "could not serialize access due to concurrent update",
                C::CouldNotSerializeRepeatableRead,
            ),
        ];
        for (content, expected) in cases {
            assert_eq!(classify(LogLevel::Error, content), expected, "{}", content);
        }
    }

    #[test]
    fn test_identify_marker_any_level() {
        let m = eval(LogLevel::Error, "rpglog-collector-identify: primary").unwrap();
        assert_eq!(m.classification, LogClassification::CollectorIdentify);
        assert_eq!(
            m.details["config_section"],
            DetailValue::Text("primary".into())
        );
    }

    #[test]
    fn test_duration_without_statement_has_no_sample() {
        let m = eval(LogLevel::Log, "duration: 0.047 ms\n").unwrap();
        assert_eq!(m.classification, LogClassification::StatementDuration);
        assert!(m.sample.is_none());
        assert!(m.details.is_empty());
    }

    #[test]
    fn test_bind_duration_is_suppressed() {
        let m = eval(LogLevel::Log, "duration: 0.100 ms  bind <unnamed>: SELECT 1").unwrap();
        assert_eq!(m.classification, LogClassification::StatementDuration);
        assert!(m.sample.is_none());
    }

    #[test]
    fn test_auto_explain_truncated() {
        let m = eval(
            LogLevel::Log,
            "duration: 12.5 ms  plan:\n{\"Query Text\": \"SELECT 1\", \"Plan\": {",
        )
        .unwrap();
        assert_eq!(m.classification, LogClassification::StatementAutoExplain);
        assert_eq!(m.details["truncated"], DetailValue::Bool(true));
        assert!(m.sample.is_none());
    }
}
