//! rpglog-core: PostgreSQL log ingestion and classification.
//!
//! Provides:
//! - `collector`: log sources, prefix parsing, dwell buffer and classifier
//! - `storage`: data model, batch spool and persisted agent state
//! - `config`: per-server pipeline configuration

pub mod collector;
pub mod config;
pub mod storage;

/// Short git SHA the crate was built from.
pub const BUILD_SHA: &str = env!("GIT_SHA");
