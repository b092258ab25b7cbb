//! Core abstractions for the CRM MCP gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `EventLog` - Per-session bounded history + broadcast for stream resumption
//! - `ExecutionCapability` - The injected CRM execution seam
//! - `SessionStream` / `NotificationSink` - Transport seams used by the session table
//! - Configuration types shared by the session and transport layers

pub mod config;
pub mod event_log;
pub mod traits;

pub use config::{EventLogConfig, SessionConfig};
pub use event_log::{EventId, EventLog, LogEntry};
pub use traits::{
    ExecutionCapability, ExecutionError, NotificationSink, SessionStream, TransportError,
};
