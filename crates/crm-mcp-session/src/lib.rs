//! Session lifecycle management for the CRM MCP gateway.
//!
//! Provides:
//! - `SessionTable` - Concurrency-safe registry with heartbeat and reaper tasks
//! - `SessionHandle` - Per-request view of a session
//! - `SessionState` - The session state machine

mod heartbeat;
pub mod record;
pub mod table;

pub use record::{SessionHandle, SessionState};
pub use table::{SessionTable, TableStats};
