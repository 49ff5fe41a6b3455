// ---------------------------------------------------------------------------
// PostgreSQL log records
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity / message kind of a PostgreSQL log line.
///
/// `Unknown` marks text that never matched a level keyword, i.e. a
/// continuation that still has to be merged into its predecessor.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    #[default]
    Unknown,
    Debug,
    Info,
    Notice,
    Log,
    Warning,
    Error,
    Fatal,
    Panic,
    Detail,
    Hint,
    Context,
    Statement,
    Query,
    Location,
}

impl LogLevel {
    /// Parses the level keyword as it appears before `:  ` in a log line.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let level = match keyword {
            "DEBUG" | "DEBUG1" | "DEBUG2" | "DEBUG3" | "DEBUG4" | "DEBUG5" => Self::Debug,
            "INFO" => Self::Info,
            "NOTICE" => Self::Notice,
            "LOG" => Self::Log,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            "PANIC" => Self::Panic,
            "DETAIL" => Self::Detail,
            "HINT" => Self::Hint,
            "CONTEXT" => Self::Context,
            "STATEMENT" => Self::Statement,
            "QUERY" => Self::Query,
            "LOCATION" => Self::Location,
            _ => return None,
        };
        Some(level)
    }

    /// Levels PostgreSQL emits as secondary lines of a multi-line event.
    pub fn is_follow_on(self) -> bool {
        matches!(
            self,
            Self::Statement | Self::Detail | Self::Hint | Self::Context | Self::Query
        )
    }
}

/// What a log event is about.
///
/// Assigned by the classifier's rule table; `Unknown` when no rule matched.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogClassification {
    #[default]
    Unknown,

    // Server events
    ServerCrashed,
    ServerProcessExited,
    ServerStart,
    ServerStartRecovering,
    ServerShutdown,
    ServerOutOfMemory,
    ServerInvalidChecksum,
    ServerReload,
    ServerTempFileCreated,
    ServerMisc,

    // Connections
    ConnectionReceived,
    ConnectionAuthorized,
    ConnectionRejected,
    ConnectionDisconnected,
    ConnectionClientFailedToConnect,
    ConnectionLost,
    ConnectionLostOpenTx,
    ConnectionTerminated,
    OutOfConnections,
    TooManyConnectionsRole,
    TooManyConnectionsDatabase,
    CouldNotAcceptSslConnection,
    ProtocolErrorUnsupportedVersion,
    ProtocolErrorIncompleteMessage,

    // Checkpointer
    CheckpointStarting,
    CheckpointComplete,
    CheckpointTooFrequent,
    RestartpointStarting,
    RestartpointComplete,
    RestartpointAt,

    // WAL
    WalInvalidRecordLength,
    WalRedo,
    WalArchiveCommandFailed,
    WalBaseBackupComplete,

    // Autovacuum
    AutovacuumCancel,
    TxidWraparoundWarning,
    TxidWraparoundError,
    AutovacuumLauncherStarted,
    AutovacuumLauncherShuttingDown,
    AutovacuumCompleted,
    AutoanalyzeCompleted,
    SkippingVacuumLockNotAvailable,
    SkippingAnalyzeLockNotAvailable,

    // Locks
    LockAcquired,
    LockWaiting,
    LockTimeout,
    LockDeadlockDetected,
    LockDeadlockAvoided,

    // Statements
    StatementDuration,
    StatementCanceledTimeout,
    StatementCanceledUser,
    StatementLog,
    StatementAutoExplain,

    // Standby
    StandbyRestoredWalFromArchive,
    StandbyStartedStreaming,
    StandbyStreamingInterrupted,
    StandbyStoppedStreaming,
    StandbyConsistentRecoveryState,
    StandbyStatementCanceled,
    StandbyInvalidTimeline,

    // Constraint violations
    UniqueConstraintViolation,
    ForeignKeyConstraintViolation,
    NotNullConstraintViolation,
    CheckConstraintViolation,
    ExclusionConstraintViolation,

    // Query errors
    SyntaxError,
    InvalidInputSyntax,
    ValueTooLongForType,
    InvalidValue,
    MalformedArrayLiteral,
    SubqueryMissingAlias,
    InsertTargetColumnMismatch,
    AnyAllRequiresArray,
    ColumnMissingFromGroupBy,
    RelationDoesNotExist,
    ColumnDoesNotExist,
    OperatorDoesNotExist,
    ColumnReferenceAmbiguous,
    PermissionDenied,
    TransactionIsAborted,
    OnConflictNoConstraintMatch,
    OnConflictRowAffectedTwice,
    ColumnCannotBeCast,
    DivisionByZero,
    CannotDrop,
    IntegerOutOfRange,
    InvalidRegexp,
    ParamMissing,
    FunctionDoesNotExist,
    NoSuchSavepoint,
    UnterminatedQuotedString,
    UnterminatedQuotedIdentifier,
    InvalidByteSequence,
    CouldNotSerializeRepeatableRead,
    CouldNotSerializeSerializable,
    InconsistentRangeBounds,

    // Agent marker
    CollectorIdentify,
}

/// A typed value extracted from log content.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DetailValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    IntList(Vec<i64>),
}

/// Structured fields extracted from a classified line, keyed by name.
pub type Details = BTreeMap<String, DetailValue>;

/// One logical PostgreSQL log record.
///
/// `content` holds the raw text after the prefix while the record is inside
/// the pipeline; it is cleared before the record is handed to a sender.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct LogLine {
    pub uuid: Uuid,
    /// Set on follow-on lines only; references the primary line's `uuid`.
    pub parent_uuid: Option<Uuid>,

    pub occurred_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,

    /// 0 when the source line carries no pid.
    pub backend_pid: i32,
    pub username: Option<String>,
    pub database: Option<String>,
    pub application: Option<String>,

    pub log_level: LogLevel,
    pub content: String,

    pub classification: LogClassification,
    pub details: Details,
    pub query: Option<String>,
    pub related_pids: Vec<i32>,

    /// Offsets into the originating file or stream, `byte_end` inclusive.
    pub byte_start: i64,
    pub byte_content_start: i64,
    pub byte_end: i64,
}

impl LogLine {
    /// Creates an unclassified line with a fresh identity.
    pub fn new(occurred_at: DateTime<Utc>, collected_at: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            occurred_at,
            collected_at,
            backend_pid: 0,
            username: None,
            database: None,
            application: None,
            log_level: LogLevel::Unknown,
            content: String::new(),
            classification: LogClassification::Unknown,
            details: Details::new(),
            query: None,
            related_pids: Vec::new(),
            byte_start: 0,
            byte_content_start: 0,
            byte_end: 0,
        }
    }
}

/// Format of an embedded EXPLAIN plan.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExplainFormat {
    Json,
    Text,
}

/// Where an EXPLAIN plan came from.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExplainSource {
    AutoExplain,
}

/// EXPLAIN plan attached to a query sample.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ExplainPlan {
    pub output: String,
    pub format: ExplainFormat,
    pub source: ExplainSource,
}

/// A single observed query execution.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct QuerySample {
    pub occurred_at: DateTime<Utc>,
    pub username: Option<String>,
    pub database: Option<String>,
    pub query: String,
    pub runtime_ms: f64,
    /// Bind parameters in `$n` order; `None` is an SQL NULL.
    pub parameters: Vec<Option<String>>,
    /// Identity of the log line the sample was derived from.
    pub log_line_uuid: Uuid,
    pub explain: Option<ExplainPlan>,
}

impl QuerySample {
    pub fn has_explain(&self) -> bool {
        self.explain.is_some()
    }
}
