//! Discovery of a server's logging settings.
//!
//! With a PostgreSQL connection the collector can find the active log file
//! (`pg_current_logfile()`), the configured `log_line_prefix` and the
//! `log_timezone` instead of taking them from the command line.

use std::path::{Path, PathBuf};

use super::parser::PrefixFormat;
use crate::config::{LogTimezone, parse_timezone};

/// Error type for settings discovery.
#[derive(Debug)]
pub enum LocateError {
    /// Environment variable not set.
    EnvNotSet(String),
    /// Connection failed.
    ConnectionError(String),
    /// Query execution failed.
    QueryError(String),
    /// Server is not logging to a file we can read.
    NoLogFile,
}

impl std::fmt::Display for LocateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocateError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            LocateError::ConnectionError(msg) => write!(f, "PostgreSQL: {}", msg),
            LocateError::QueryError(msg) => write!(f, "PostgreSQL query error: {}", msg),
            LocateError::NoLogFile => {
                write!(f, "pg_current_logfile() returned no result (is logging_collector on?)")
            }
        }
    }
}

impl std::error::Error for LocateError {}

/// Logging settings read from a running server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSettings {
    pub data_directory: Option<String>,
    pub log_line_prefix: Option<String>,
    pub log_timezone: Option<String>,
    /// Active stderr log file as reported by the server, maybe relative.
    pub current_logfile: Option<String>,
}

impl LogSettings {
    /// Absolute path of the active log file.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.current_logfile
            .as_deref()
            .map(|f| resolve_log_path(self.data_directory.as_deref(), f))
    }

    /// Supported layout matching `log_line_prefix`, if any.
    pub fn prefix_format(&self) -> Option<PrefixFormat> {
        self.log_line_prefix
            .as_deref()
            .and_then(PrefixFormat::from_log_line_prefix)
    }

    /// `log_timezone` as a zone, if it is recognized.
    pub fn timezone(&self) -> Option<LogTimezone> {
        self.log_timezone
            .as_deref()
            .and_then(|tz| parse_timezone(tz).ok())
    }
}

/// Resolve a log file path relative to the data directory.
pub fn resolve_log_path(data_directory: Option<&str>, log_file: &str) -> PathBuf {
    let path = Path::new(log_file);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match data_directory {
        Some(dd) => Path::new(dd).join(path),
        None => path.to_path_buf(),
    }
}

/// Builds a libpq-style connection string from standard environment
/// variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub fn connection_string_from_env() -> Result<String, LocateError> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .map_err(|_| LocateError::EnvNotSet("PGUSER or USER".to_string()))?;

    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let password = std::env::var("PGPASSWORD").unwrap_or_default();
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

    Ok(if password.is_empty() {
        format!(
            "host={} port={} user={} dbname={}",
            host, port, user, database
        )
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    })
}

#[cfg(feature = "postgres")]
mod pg {
    use std::path::PathBuf;

    use postgres::{Client, NoTls};
    use tracing::debug;

    use super::{LocateError, LogSettings, connection_string_from_env, resolve_log_path};

    /// Connects using the standard `PG*` environment variables.
    pub fn connect_from_env() -> Result<Client, LocateError> {
        let conn_str = connection_string_from_env()?;
        Client::connect(&conn_str, NoTls).map_err(|e| LocateError::ConnectionError(e.to_string()))
    }

    /// Reads the logging settings of the connected server.
    pub fn discover(client: &mut Client) -> Result<LogSettings, LocateError> {
        let settings = LogSettings {
            data_directory: show_setting(client, "data_directory")?,
            log_line_prefix: show_setting(client, "log_line_prefix")?,
            log_timezone: show_setting(client, "log_timezone")?,
            current_logfile: query_current_logfile(client)?,
        };
        debug!(?settings, "discovered log settings");
        Ok(settings)
    }

    /// Re-reads only the active log file. Used to follow rotation.
    pub fn current_logfile(client: &mut Client) -> Result<Option<String>, LocateError> {
        query_current_logfile(client)
    }

    /// Follows `pg_current_logfile()` across log rotation.
    pub struct LogfileWatcher {
        client: Client,
        data_directory: Option<String>,
    }

    impl LogfileWatcher {
        /// Connects from the environment and reads the initial settings.
        pub fn connect() -> Result<(Self, LogSettings), LocateError> {
            let mut client = connect_from_env()?;
            let settings = discover(&mut client)?;
            let watcher = Self {
                client,
                data_directory: settings.data_directory.clone(),
            };
            Ok((watcher, settings))
        }

        /// Absolute path of the active log file.
        pub fn current_path(&mut self) -> Result<PathBuf, LocateError> {
            let file = current_logfile(&mut self.client)?.ok_or(LocateError::NoLogFile)?;
            Ok(resolve_log_path(self.data_directory.as_deref(), &file))
        }
    }

    /// Execute `SHOW <setting>` and return the value.
    fn show_setting(client: &mut Client, name: &str) -> Result<Option<String>, LocateError> {
        let query = format!("SHOW {}", name);
        let row = client
            .query_one(&query as &str, &[])
            .map_err(|e| LocateError::QueryError(format!("{}: {}", query, e)))?;
        Ok(row.try_get::<_, String>(0).ok())
    }

    /// Query `pg_current_logfile('stderr')` for the active log file path.
    fn query_current_logfile(client: &mut Client) -> Result<Option<String>, LocateError> {
        let row = client
            .query_one("SELECT pg_current_logfile('stderr')", &[])
            .map_err(|e| LocateError::QueryError(format!("pg_current_logfile: {}", e)))?;
        Ok(row
            .try_get::<_, Option<String>>(0)
            .ok()
            .flatten()
            .filter(|s| !s.is_empty()))
    }
}

#[cfg(feature = "postgres")]
pub use pg::{LogfileWatcher, connect_from_env, current_logfile, discover};
