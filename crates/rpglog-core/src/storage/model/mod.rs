//! Data model of the log pipeline.
//!
//! - [`LogLine`]: one logical log line after reassembly and classification
//! - [`QuerySample`]: a statement observation with runtime, parameters and plan

mod log;

pub use log::{
    DetailValue, Details, ExplainFormat, ExplainPlan, ExplainSource, LogClassification,
    LogLevel, LogLine, QuerySample,
};
