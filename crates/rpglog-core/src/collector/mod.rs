//! Log collection for PostgreSQL servers.
//!
//! ```text
//!  FileTailer ──┐
//!  envelope  ───┼─► LogSourceSender ─► [bounded queue] ─► LogTransform
//!  receivers ───┘                                           │
//!                         PrefixParser ─► LogStream (dwell) ─┤
//!                                                           ▼
//!                                         classify ─► BatchSender
//! ```

pub mod log_collector;

pub use log_collector::{
    CollectorOptions, LogCollector, LogSourceSender, LogTransform, RawLogLine, SourceMessage,
};
