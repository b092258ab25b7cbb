//! Session table: the single owner of every live session.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, PoisonError},
};

use crm_mcp_core::{EventLog, SessionConfig, SessionStream};
use futures::future;
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle, time::Instant};

use crate::{
    heartbeat,
    record::{SessionHandle, SessionRecord, SessionState},
};

/// Point-in-time counters for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableStats {
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub average_session_age_secs: f64,
}

/// State shared between the table and its background tasks.
pub(crate) struct Shared<T> {
    sessions: RwLock<HashMap<String, SessionRecord<T>>>,
    config: SessionConfig,
}

impl<T: SessionStream> Shared<T> {
    /// Detach a record; teardown happens outside the lock.
    async fn detach(&self, id: &str) -> Option<SessionRecord<T>> {
        self.sessions.write().await.remove(id)
    }

    pub(crate) async fn close(&self, id: &str) -> bool {
        let Some(record) = self.detach(id).await else {
            return false;
        };
        record.teardown().await;
        tracing::info!(session_id = %id, "Session closed");
        true
    }

    pub(crate) async fn set_state(self: &Arc<Self>, id: &str, state: SessionState) {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.get_mut(id) else {
            return;
        };
        let previous = record.state;
        record.state = state;
        record.touch();

        if state == SessionState::Active {
            if record.heartbeat.is_none() {
                record.heartbeat = Some(heartbeat::spawn_heartbeat(
                    Arc::downgrade(self),
                    record.id.clone(),
                    Arc::clone(&record.stream),
                    self.config.heartbeat_interval(),
                ));
            }
        } else {
            record.cancel_heartbeat();
        }
        tracing::debug!(session_id = %id, ?previous, current = ?state, "Session state changed");
    }

    /// Last activity of the record that still owns `stream`, if it is active.
    ///
    /// A replaced session has the same id but a different stream.
    pub(crate) async fn active_last_activity(&self, id: &str, stream: &Arc<T>) -> Option<Instant> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .filter(|r| Arc::ptr_eq(&r.stream, stream) && r.state == SessionState::Active)
            .map(|r| r.last_activity)
    }

    pub(crate) async fn touch_if_owned(&self, id: &str, stream: &Arc<T>) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions
            .get_mut(id)
            .filter(|r| Arc::ptr_eq(&r.stream, stream))
        {
            record.touch();
        }
    }

    pub(crate) async fn mark_closing_if_owned(&self, id: &str, stream: &Arc<T>) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions
            .get_mut(id)
            .filter(|r| Arc::ptr_eq(&r.stream, stream))
        {
            record.state = SessionState::Closing;
            // The heartbeat task is the caller; detach rather than abort it.
            record.heartbeat = None;
        }
    }

    pub(crate) async fn reap(&self) -> usize {
        let expired: Vec<SessionRecord<T>> = {
            let mut sessions = self.sessions.write().await;
            let now = Instant::now();
            let timeout = self.config.session_timeout();
            let ids: Vec<String> = sessions
                .values()
                .filter(|r| r.is_reapable(now, timeout))
                .map(|r| r.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let count = expired.len();
        for record in expired {
            tracing::info!(
                session_id = %record.id,
                state = ?record.state,
                idle_secs = record.last_activity.elapsed().as_secs(),
                "Reaping session"
            );
            record.teardown().await;
        }
        count
    }
}

/// Concurrency-safe registry of sessions.
///
/// Create, get, update, close and reap all serialize on one short critical
/// section over the map. No lock is held while a stream is being released.
pub struct SessionTable<T: SessionStream> {
    shared: Arc<Shared<T>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SessionStream> SessionTable<T> {
    /// Create an empty table. Call `start_reaper` to enable expiry.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                config,
            }),
            reaper: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Create an event log with this table's retention settings.
    #[must_use]
    pub fn new_event_log(&self) -> Arc<EventLog> {
        Arc::new(EventLog::new(&self.shared.config.event_log))
    }

    /// Register a session in `Initializing`.
    ///
    /// A session already registered under `id` is closed first.
    pub async fn create_session(
        &self,
        id: impl Into<String>,
        stream: Arc<T>,
        event_log: Arc<EventLog>,
    ) {
        let id = id.into();
        let record = SessionRecord::new(id.clone(), stream, event_log);

        loop {
            let previous = match self.shared.sessions.write().await.entry(id.clone()) {
                Entry::Occupied(occupied) => occupied.remove(),
                Entry::Vacant(vacant) => {
                    vacant.insert(record);
                    break;
                }
            };
            tracing::warn!(session_id = %id, "Replacing existing session with the same id");
            previous.teardown().await;
        }

        tracing::info!(session_id = %id, "Session created");
    }

    /// Look up a session. Every hit counts as activity.
    pub async fn get_session(&self, id: &str) -> Option<SessionHandle<T>> {
        let mut sessions = self.shared.sessions.write().await;
        let record = sessions.get_mut(id)?;
        record.touch();
        Some(record.handle())
    }

    /// Change a session's state and touch it. No-op when absent.
    ///
    /// Entering `Active` arms the heartbeat, any other state cancels it, and
    /// `Closed` closes the session.
    pub async fn update_status(&self, id: &str, state: SessionState) {
        if state == SessionState::Closed {
            self.close_session(id).await;
            return;
        }
        self.shared.set_state(id, state).await;
    }

    /// Tear down and remove a session. Idempotent.
    ///
    /// Returns whether a session was removed.
    pub async fn close_session(&self, id: &str) -> bool {
        self.shared.close(id).await
    }

    /// Close every session that is idle past the timeout or marked `Closing`.
    ///
    /// Returns the number of sessions reaped.
    pub async fn reap_expired(&self) -> usize {
        self.shared.reap().await
    }

    /// Spawn the periodic reaper. Calling it again restarts the task.
    pub fn start_reaper(&self) {
        let handle = heartbeat::spawn_reaper(
            Arc::downgrade(&self.shared),
            self.shared.config.reaper_interval(),
        );
        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_reaper(&self) {
        let handle = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Stop the reaper, then close every remaining session.
    pub async fn shutdown(&self) {
        self.stop_reaper();
        let drained: Vec<SessionRecord<T>> = {
            let mut sessions = self.shared.sessions.write().await;
            sessions.drain().map(|(_, record)| record).collect()
        };
        let count = drained.len();
        future::join_all(drained.into_iter().map(SessionRecord::teardown)).await;
        tracing::info!(closed = count, "Session table shut down");
    }

    /// Counters for health reporting, taken under a short read lock.
    pub async fn snapshot(&self) -> TableStats {
        let sessions = self.shared.sessions.read().await;
        let now = Instant::now();
        let total = sessions.len();
        let active = sessions
            .values()
            .filter(|r| r.state == SessionState::Active)
            .count();
        let total_age: f64 = sessions
            .values()
            .map(|r| now.duration_since(r.created_at).as_secs_f64())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let average = if total == 0 {
            0.0
        } else {
            total_age / total as f64
        };
        TableStats {
            active_sessions: active,
            total_sessions: total,
            average_session_age_secs: average,
        }
    }

    pub async fn len(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<T: SessionStream> Drop for SessionTable<T> {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use crm_mcp_core::TransportError;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct MockStream {
        closed: AtomicUsize,
        connected: AtomicBool,
        failing: AtomicBool,
    }

    impl MockStream {
        fn connected() -> Arc<Self> {
            let stream = Self::default();
            stream.connected.store(true, Ordering::SeqCst);
            Arc::new(stream)
        }

        fn close_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionStream for MockStream {
        async fn heartbeat(&self) -> Result<bool, TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            Ok(self.connected.load(Ordering::SeqCst))
        }

        async fn close(&self) -> Result<(), TransportError> {
            if self.closed.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(TransportError::Closed);
            }
            Ok(())
        }
    }

    fn table() -> SessionTable<MockStream> {
        SessionTable::new(SessionConfig::default())
    }

    async fn active_session(table: &SessionTable<MockStream>, id: &str, stream: Arc<MockStream>) {
        table
            .create_session(id, stream, table.new_event_log())
            .await;
        table.update_status(id, SessionState::Active).await;
    }

    #[tokio::test]
    async fn create_registers_initializing_session() {
        let table = table();
        table
            .create_session("s1", Arc::new(MockStream::default()), table.new_event_log())
            .await;

        let handle = table.get_session("s1").await.unwrap();
        assert_eq!(handle.state, SessionState::Initializing);
        assert!(!handle.is_active());

        table.update_status("s1", SessionState::Active).await;
        assert!(table.get_session("s1").await.unwrap().is_active());
    }

    #[tokio::test]
    async fn reused_id_closes_previous_session_first() {
        let table = table();
        let first = Arc::new(MockStream::default());
        let first_log = table.new_event_log();
        first_log.append(json!({"n": 1}));
        table
            .create_session("dup", Arc::clone(&first), Arc::clone(&first_log))
            .await;
        table.update_status("dup", SessionState::Active).await;

        let second = Arc::new(MockStream::default());
        table
            .create_session("dup", Arc::clone(&second), table.new_event_log())
            .await;

        assert_eq!(first.close_count(), 1);
        assert!(first_log.is_destroyed());
        assert_eq!(table.len().await, 1);
        let handle = table.get_session("dup").await.unwrap();
        assert!(Arc::ptr_eq(&handle.stream, &second));
        assert_eq!(handle.state, SessionState::Initializing);
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let table = table();
        let stream = Arc::new(MockStream::default());
        let log = table.new_event_log();
        table
            .create_session("s1", Arc::clone(&stream), Arc::clone(&log))
            .await;

        assert!(table.close_session("s1").await);
        assert!(!table.close_session("s1").await);
        assert!(!table.close_session("never-created").await);

        assert!(table.is_empty().await);
        assert_eq!(stream.close_count(), 1);
        assert!(log.is_destroyed());
    }

    #[tokio::test]
    async fn update_status_on_absent_id_is_noop() {
        let table = table();
        table.update_status("ghost", SessionState::Active).await;
        assert!(table.get_session("ghost").await.is_none());
    }

    #[tokio::test]
    async fn update_to_closed_removes_session() {
        let table = table();
        active_session(&table, "s1", Arc::new(MockStream::default())).await;
        table.update_status("s1", SessionState::Closed).await;
        assert!(table.get_session("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_session_touches() {
        let table = table();
        active_session(&table, "s1", Arc::new(MockStream::default())).await;
        let before = table.get_session("s1").await.unwrap().last_activity;

        tokio::time::sleep(Duration::from_secs(120)).await;
        let after = table.get_session("s1").await.unwrap().last_activity;
        assert!(after.duration_since(before) >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_pass_removes_idle_and_keeps_recent() {
        let table = table();
        active_session(&table, "idle", Arc::new(MockStream::default())).await;
        active_session(&table, "busy", Arc::new(MockStream::default())).await;

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        assert!(table.get_session("busy").await.is_some());
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;

        assert_eq!(table.reap_expired().await, 1);
        assert!(table.get_session("idle").await.is_none());
        assert!(table.get_session("busy").await.is_some());
    }

    #[tokio::test]
    async fn closing_sessions_are_reaped_immediately() {
        let table = table();
        let stream = Arc::new(MockStream::default());
        active_session(&table, "s1", Arc::clone(&stream)).await;
        table.update_status("s1", SessionState::Closing).await;

        assert_eq!(table.reap_expired().await, 1);
        assert_eq!(stream.close_count(), 1);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_expires_sessions() {
        let table = table();
        table.start_reaper();
        active_session(&table, "s1", Arc::new(MockStream::default())).await;

        tokio::time::sleep(Duration::from_secs(12 * 60)).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_heartbeat_keeps_session_alive() {
        let table = table();
        active_session(&table, "s1", MockStream::connected()).await;

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert_eq!(table.reap_expired().await, 0);
        assert_eq!(table.snapshot().await.active_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_failure_marks_closing() {
        let table = table();
        let stream = MockStream::connected();
        stream.failing.store(true, Ordering::SeqCst);
        active_session(&table, "s1", Arc::clone(&stream)).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        let stats = table.snapshot().await;
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active_sessions, 0);

        assert_eq!(table.reap_expired().await, 1);
        assert_eq!(stream.close_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let table = table();
        table.start_reaper();
        let streams: Vec<Arc<MockStream>> = (0..3).map(|_| Arc::new(MockStream::default())).collect();
        for (n, stream) in streams.iter().enumerate() {
            active_session(&table, &format!("s{n}"), Arc::clone(stream)).await;
        }

        table.shutdown().await;

        assert!(table.is_empty().await);
        assert!(streams.iter().all(|s| s.close_count() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_counts_and_age() {
        let table = table();
        active_session(&table, "a", Arc::new(MockStream::default())).await;
        table
            .create_session("b", Arc::new(MockStream::default()), table.new_event_log())
            .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = table.snapshot().await;
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert!(stats.average_session_age_secs >= 10.0);
    }

    #[test]
    fn close_absent_session_blocking() {
        let table = table();
        tokio_test::block_on(async {
            assert!(!table.close_session("nothing").await);
        });
    }
}
