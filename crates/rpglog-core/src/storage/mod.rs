pub mod model;
pub mod spool;
pub mod state;

pub use spool::{BatchSender, LogBatch, SendError, SpoolSender};
pub use state::{AgentState, ServerState};
