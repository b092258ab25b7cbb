//! Per-session transport: the protocol server bound to one session's event log.

use std::sync::{
    Arc, Mutex, OnceLock, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use crm_mcp_core::{
    EventId, EventLog, LogEntry, NotificationSink, SessionStream, TransportError,
};
use futures::stream::BoxStream;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    protocol::{ClientMessage, JsonRpcNotification, JsonRpcResponse, LogLevel, codes},
    server::McpServer,
};

/// Replay backlog followed by live entries for one push channel.
pub type EventStream = BoxStream<'static, Result<LogEntry, TransportError>>;

/// Transport for one session.
///
/// Requests are handled by the shared `McpServer`; server-initiated
/// notifications are appended to the session's event log, from which
/// attached push channels are fed.
pub struct SessionTransport {
    server: Arc<McpServer>,
    event_log: Arc<EventLog>,
    session_id: OnceLock<String>,
    terminated: AtomicBool,
    released: AtomicBool,
    connected: Arc<AtomicUsize>,
    log_level: Mutex<LogLevel>,
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("session_id", &self.session_id.get())
            .field("terminated", &self.terminated)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

/// Keeps a push channel counted as connected until dropped.
#[derive(Debug)]
pub struct StreamGuard {
    connected: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.connected.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionTransport {
    #[must_use]
    pub fn new(server: Arc<McpServer>, event_log: Arc<EventLog>) -> Self {
        Self {
            server,
            event_log,
            session_id: OnceLock::new(),
            terminated: AtomicBool::new(false),
            released: AtomicBool::new(false),
            connected: Arc::new(AtomicUsize::new(0)),
            log_level: Mutex::new(LogLevel::default()),
        }
    }

    /// Session id, once the handshake has succeeded.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    /// Run the `initialize` exchange.
    ///
    /// A session id is generated only when the server accepts the request;
    /// otherwise `session_id()` stays `None`.
    pub async fn handshake(&self, message: &ClientMessage) -> JsonRpcResponse {
        let response = self.server.handle(message, self).await.unwrap_or_else(|| {
            JsonRpcResponse::error(
                message.id.clone(),
                codes::INVALID_REQUEST,
                "Handshake requires an initialize request",
            )
        });
        if response.is_success() {
            let id = self.session_id.get_or_init(|| Uuid::new_v4().to_string());
            tracing::debug!(session_id = %id, "Handshake completed");
        }
        response
    }

    /// Handle a message on an established session.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the session was terminated.
    pub async fn handle_message(
        &self,
        message: &ClientMessage,
    ) -> Result<Option<JsonRpcResponse>, TransportError> {
        if self.terminated.load(Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let response = self.server.handle(message, self).await;

        if message.method() == Some("logging/setLevel")
            && response.as_ref().is_some_and(JsonRpcResponse::is_success)
        {
            let level = message
                .params
                .as_ref()
                .and_then(|p| serde_json::from_value::<LogLevel>(p["level"].clone()).ok());
            if let Some(level) = level {
                *self.log_level.lock().unwrap_or_else(PoisonError::into_inner) = level;
                tracing::debug!(session_id = ?self.session_id(), ?level, "Client log level changed");
            }
        }
        Ok(response)
    }

    /// Attach a push channel, replaying everything after `after` first.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the session was terminated.
    pub fn attach(
        &self,
        after: Option<EventId>,
    ) -> Result<(StreamGuard, EventStream), TransportError> {
        if self.terminated.load(Ordering::SeqCst) || self.event_log.is_destroyed() {
            return Err(TransportError::Closed);
        }
        self.connected.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard {
            connected: Arc::clone(&self.connected),
        };
        Ok((guard, self.event_log.stream_after(after)))
    }

    /// Number of push channels currently attached.
    #[must_use]
    pub fn connected_streams(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Client-requested termination. Further messages are rejected.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the session was already terminated.
    pub fn terminate(&self) -> Result<(), TransportError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        tracing::debug!(session_id = ?self.session_id(), "Session transport terminated");
        Ok(())
    }
}

#[async_trait]
impl SessionStream for SessionTransport {
    async fn heartbeat(&self) -> Result<bool, TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.connected.load(Ordering::SeqCst) > 0)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl NotificationSink for SessionTransport {
    fn notify(&self, method: &str, params: Value) {
        let minimum = *self.log_level.lock().unwrap_or_else(PoisonError::into_inner);
        let level = params
            .get("level")
            .and_then(|l| serde_json::from_value::<LogLevel>(l.clone()).ok());
        if level.is_some_and(|level| level < minimum) {
            return;
        }

        match serde_json::to_value(JsonRpcNotification::new(method, params)) {
            Ok(payload) => {
                let event_id = self.event_log.append(payload);
                tracing::trace!(session_id = ?self.session_id(), %event_id, method, "Queued notification");
            }
            Err(e) => tracing::warn!(method, error = %e, "Failed to encode notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use crm_mcp_core::{EventLogConfig, ExecutionCapability, ExecutionError};
    use crm_mcp_executor::catalog::catalog_for;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    struct OkCapability;

    #[async_trait]
    impl ExecutionCapability for OkCapability {
        async fn execute(&self, _: &str, _: &str, params: Value) -> Result<Value, ExecutionError> {
            Ok(params)
        }
    }

    fn transport() -> SessionTransport {
        let server =
            McpServer::with_catalog(Arc::new(OkCapability), catalog_for(&["tickets"])).unwrap();
        SessionTransport::new(
            Arc::new(server),
            Arc::new(EventLog::new(&EventLogConfig::default())),
        )
    }

    fn initialize() -> ClientMessage {
        ClientMessage::request(1, "initialize", json!({"protocolVersion": "2025-03-26"}))
    }

    #[tokio::test]
    async fn handshake_assigns_id_only_on_success() {
        let rejected = transport();
        let resp = rejected
            .handshake(&ClientMessage::request(1, "initialize", json!({})))
            .await;
        assert!(!resp.is_success());
        assert!(rejected.session_id().is_none());

        let accepted = transport();
        let resp = accepted.handshake(&initialize()).await;
        assert!(resp.is_success());
        let id = accepted.session_id().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn tool_calls_land_in_the_event_log() {
        let transport = transport();
        transport.handshake(&initialize()).await;
        let call = ClientMessage::request(
            2,
            "tools/call",
            json!({"name": "tickets_get", "arguments": {"id": "7"}}),
        );
        tokio_test::assert_ok!(transport.handle_message(&call).await);

        let mut seen = Vec::new();
        transport.event_log.replay_after(None, |_, payload| seen.push(payload.clone()));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["method"], "notifications/message");
        assert_eq!(seen[0]["params"]["level"], "info");
    }

    #[tokio::test]
    async fn set_level_filters_notifications() {
        let transport = transport();
        let set = ClientMessage::request(2, "logging/setLevel", json!({"level": "error"}));
        tokio_test::assert_ok!(transport.handle_message(&set).await);

        transport.notify("notifications/message", json!({"level": "info", "data": "dropped"}));
        transport.notify("notifications/message", json!({"level": "critical", "data": "kept"}));
        assert_eq!(transport.event_log.len(), 1);
    }

    #[tokio::test]
    async fn attached_streams_count_as_connected() {
        let transport = transport();
        assert!(!transport.heartbeat().await.unwrap());

        let (guard, mut events) = transport.attach(None).unwrap();
        assert!(transport.heartbeat().await.unwrap());

        transport.notify("notifications/progress", json!({"progress": 1}));
        let entry = events.next().await.unwrap().unwrap();
        assert_eq!(entry.payload["method"], "notifications/progress");

        drop(guard);
        assert_eq!(transport.connected_streams(), 0);
    }

    #[tokio::test]
    async fn terminated_transport_rejects_messages() {
        let transport = transport();
        tokio_test::assert_ok!(transport.terminate());
        assert!(matches!(transport.terminate(), Err(TransportError::Closed)));

        let ping = ClientMessage::request(3, "ping", json!({}));
        assert!(matches!(
            transport.handle_message(&ping).await,
            Err(TransportError::Closed)
        ));
        assert!(transport.attach(None).is_err());
    }

    #[tokio::test]
    async fn close_is_reported_once() {
        let transport = transport();
        tokio_test::assert_ok!(transport.close().await);
        assert!(matches!(transport.close().await, Err(TransportError::Closed)));
        assert!(transport.heartbeat().await.is_err());
    }
}
