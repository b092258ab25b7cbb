//! Session records and the session state machine.

use std::{sync::Arc, time::Duration};

use crm_mcp_core::{EventLog, SessionStream};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, handshake not yet completed.
    Initializing,
    /// Handshake completed; requests are accepted.
    Active,
    /// Marked for teardown by an error, terminate request, heartbeat or reaper.
    Closing,
    /// Torn down. Never observed inside the session table.
    Closed,
}

/// A session owned by the session table.
pub(crate) struct SessionRecord<T> {
    pub(crate) id: String,
    pub(crate) state: SessionState,
    pub(crate) created_at: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) stream: Arc<T>,
    pub(crate) event_log: Arc<EventLog>,
    pub(crate) heartbeat: Option<JoinHandle<()>>,
}

impl<T: SessionStream> SessionRecord<T> {
    pub(crate) fn new(id: String, stream: Arc<T>, event_log: Arc<EventLog>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SessionState::Initializing,
            created_at: now,
            last_activity: now,
            stream,
            event_log,
            heartbeat: None,
        }
    }

    /// Record activity. Always writes the current clock value.
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn cancel_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_reapable(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::Closing || now.duration_since(self.last_activity) > timeout
    }

    pub(crate) fn handle(&self) -> SessionHandle<T> {
        SessionHandle {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            stream: Arc::clone(&self.stream),
            event_log: Arc::clone(&self.event_log),
        }
    }

    /// Terminal cleanup of a record already detached from the table.
    ///
    /// Steps run in a fixed order and a failing step never prevents the
    /// following ones.
    pub(crate) async fn teardown(mut self) {
        self.state = SessionState::Closing;
        self.cancel_heartbeat();
        self.event_log.destroy();
        if let Err(e) = self.stream.close().await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release session stream");
        }
        self.state = SessionState::Closed;
        tracing::debug!(
            session_id = %self.id,
            state = ?self.state,
            age_secs = self.created_at.elapsed().as_secs(),
            "Session torn down"
        );
    }
}

/// Snapshot of a session, valid for the duration of one request.
///
/// The table remains the owner of the record; the handle only shares the
/// stream and event log.
pub struct SessionHandle<T> {
    pub id: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub stream: Arc<T>,
    pub event_log: Arc<EventLog>,
}

impl<T> SessionHandle<T> {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

impl<T> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            stream: Arc::clone(&self.stream),
            event_log: Arc::clone(&self.event_log),
        }
    }
}

impl<T> std::fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serialization() {
        let json = serde_json::to_string(&SessionState::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
        let parsed: SessionState = serde_json::from_str("\"closing\"").unwrap();
        assert_eq!(parsed, SessionState::Closing);
    }
}
