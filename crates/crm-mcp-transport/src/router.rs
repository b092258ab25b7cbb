//! Streamable HTTP request router.
//!
//! `McpRouter` implements submit (POST), stream (GET) and terminate (DELETE)
//! against the session table; the axum handlers below only translate HTTP.
//!
//! ## Endpoints
//!
//! - `POST {path}` - Send a JSON-RPC message; `initialize` without a session opens one
//! - `GET {path}` - Open the SSE push channel, resuming after `Last-Event-ID`
//! - `DELETE {path}` - Terminate a session
//! - `GET /health` - Liveness and session counters

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use crm_mcp_core::{EventId, LogEntry, TransportError};
use crm_mcp_session::{SessionHandle, SessionState, SessionTable};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    health::{HealthResponse, health_check},
    protocol::{ClientMessage, JsonRpcResponse, codes},
    server::{BuildError, ServerSingleton},
    stream::SessionTransport,
};

/// Header carrying the session id in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header a reconnecting client uses to resume its push channel.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Entries buffered between the event log and one SSE connection.
const STREAM_BUFFER: usize = 64;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Stable error classification reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    BadRequest,
    InvalidSession,
    UpstreamConstructionError,
    TransportError,
    InternalError,
}

impl ErrorKind {
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::InvalidSession => StatusCode::NOT_FOUND,
            Self::UpstreamConstructionError => StatusCode::SERVICE_UNAVAILABLE,
            Self::TransportError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code for the response body.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::BadRequest => codes::INVALID_REQUEST,
            Self::InvalidSession => -32001,
            Self::UpstreamConstructionError => -32002,
            Self::TransportError => -32003,
            Self::InternalError => codes::INTERNAL_ERROR,
        }
    }
}

/// Router failure.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Invalid or expired session: {0}")]
    InvalidSession(String),
    #[error("MCP server unavailable: {0}")]
    UpstreamConstruction(#[from] BuildError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::InvalidSession(_) => ErrorKind::InvalidSession,
            Self::UpstreamConstruction(_) => ErrorKind::UpstreamConstructionError,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let mut body = JsonRpcResponse::error(None, kind.code(), self.to_string());
        if let Some(error) = body.error.as_mut() {
            error.data = Some(json!({ "kind": kind }));
        }
        (kind.status(), Json(body)).into_response()
    }
}

/// Outcome of a successful submit.
#[derive(Debug)]
pub struct Submitted {
    pub session_id: String,
    /// `None` when the message needed no reply.
    pub response: Option<JsonRpcResponse>,
}

/// Outcome of a successful terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    /// The session existed and was closed.
    Closed,
    /// No such session; treated as success.
    AlreadyGone,
}

/// Entry point for every transport request.
pub struct McpRouter {
    sessions: Arc<SessionTable<SessionTransport>>,
    servers: Arc<ServerSingleton>,
    started_at: Instant,
}

impl McpRouter {
    #[must_use]
    pub fn new(sessions: Arc<SessionTable<SessionTransport>>, servers: Arc<ServerSingleton>) -> Self {
        Self {
            sessions,
            servers,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTable<SessionTransport>> {
        &self.sessions
    }

    /// Handle a POSTed message.
    ///
    /// # Errors
    /// - `BadRequest` for malformed bodies, or a non-`initialize` message without a session
    /// - `InvalidSession` for unknown or inactive sessions
    /// - `UpstreamConstruction` when the shared server cannot be built
    /// - `Transport` when the session transport fails; the session is marked `Closing`
    /// - `Internal` when the handshake produces no session id
    pub async fn submit(
        &self,
        session_id: Option<&str>,
        body: &[u8],
    ) -> Result<Submitted, RouterError> {
        let message =
            ClientMessage::parse(body).map_err(|e| RouterError::BadRequest(e.to_string()))?;
        tracing::debug!(method = ?message.method(), session_id = ?session_id, "Routing submit");

        let Some(session_id) = session_id else {
            return self.open_session(&message).await;
        };

        let Some(session) = self.sessions.get_session(session_id).await else {
            tracing::warn!(session_id, "Submit for unknown session");
            return Err(RouterError::InvalidSession(session_id.to_string()));
        };
        if !session.is_active() {
            tracing::warn!(session_id, state = ?session.state, "Submit for inactive session");
            self.sessions.close_session(session_id).await;
            return Err(RouterError::InvalidSession(session_id.to_string()));
        }

        match session.stream.handle_message(&message).await {
            Ok(response) => Ok(Submitted {
                session_id: session.id,
                response,
            }),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Session transport failed");
                self.sessions
                    .update_status(session_id, SessionState::Closing)
                    .await;
                Err(e.into())
            }
        }
    }

    async fn open_session(&self, message: &ClientMessage) -> Result<Submitted, RouterError> {
        if !message.is_initialize() {
            tracing::warn!(method = ?message.method(), "Rejected message without a session");
            return Err(RouterError::BadRequest(
                "Missing mcp-session-id header; only initialize may open a session".into(),
            ));
        }

        let server = self.servers.get_or_create().await?;
        let event_log = self.sessions.new_event_log();
        let transport = Arc::new(SessionTransport::new(server, Arc::clone(&event_log)));

        let response = transport.handshake(message).await;
        let Some(session_id) = transport.session_id().map(str::to_string) else {
            tracing::error!(response = ?response.error, "Handshake completed without a session id");
            event_log.destroy();
            let reason = response
                .error
                .map_or_else(|| "no session id assigned".to_string(), |e| e.message);
            return Err(RouterError::Internal(format!("Handshake failed: {reason}")));
        };

        self.sessions
            .create_session(session_id.clone(), transport, event_log)
            .await;
        self.sessions
            .update_status(&session_id, SessionState::Active)
            .await;

        Ok(Submitted {
            session_id,
            response: Some(response),
        })
    }

    /// Open the push channel for a session.
    ///
    /// Entries after `last_event_id` are replayed first, then live entries
    /// follow. If the channel falls behind the log and loses messages, the
    /// session is marked `Closing`; a plain client disconnect is not an error.
    ///
    /// # Errors
    /// - `BadRequest` without a session id
    /// - `InvalidSession` for unknown or inactive sessions
    pub async fn open_stream(
        &self,
        session_id: Option<&str>,
        last_event_id: Option<&str>,
    ) -> Result<ReceiverStream<LogEntry>, RouterError> {
        let session_id = session_id
            .ok_or_else(|| RouterError::BadRequest("Missing mcp-session-id header".into()))?;
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .filter(SessionHandle::is_active)
            .ok_or_else(|| RouterError::InvalidSession(session_id.to_string()))?;

        let after = last_event_id.and_then(EventId::parse);
        let (guard, mut events) = session
            .stream
            .attach(after)
            .map_err(|_| RouterError::InvalidSession(session_id.to_string()))?;
        tracing::debug!(session_id, ?after, "Push channel attached");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session.id;
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                // A quiet log must not keep a dropped client counted as connected.
                let item = tokio::select! {
                    () = tx.closed() => {
                        tracing::debug!(session_id = %session_id, "Push channel disconnected");
                        return;
                    }
                    item = events.next() => item,
                };
                let Some(item) = item else { break };
                match item {
                    Ok(entry) => {
                        if tx.send(entry).await.is_err() {
                            tracing::debug!(session_id = %session_id, "Push channel disconnected");
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Push channel failed");
                        sessions
                            .update_status(&session_id, SessionState::Closing)
                            .await;
                        return;
                    }
                }
            }
            tracing::debug!(session_id = %session_id, "Event log closed, ending push channel");
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Terminate a session.
    ///
    /// # Errors
    /// Returns `BadRequest` without a session id.
    pub async fn terminate(&self, session_id: Option<&str>) -> Result<Terminated, RouterError> {
        let session_id = session_id
            .ok_or_else(|| RouterError::BadRequest("Missing mcp-session-id header".into()))?;
        let Some(session) = self.sessions.get_session(session_id).await else {
            tracing::debug!(session_id, "Terminate for unknown session, already gone");
            return Ok(Terminated::AlreadyGone);
        };

        self.sessions
            .update_status(session_id, SessionState::Closing)
            .await;
        if let Err(e) = session.stream.terminate() {
            tracing::warn!(session_id, error = %e, "Transport termination failed");
        }
        self.sessions.close_session(session_id).await;
        tracing::info!(session_id, "Session terminated by client");
        Ok(Terminated::Closed)
    }

    /// Current health counters.
    pub async fn health(&self) -> HealthResponse {
        let stats = self.sessions.snapshot().await;
        health_check(self.started_at, stats, self.servers.is_initialized())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST - submit a JSON-RPC message.
pub async fn mcp_post(
    State(router): State<Arc<McpRouter>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match router.submit(header(&headers, SESSION_ID_HEADER), &body).await {
        Ok(Submitted {
            session_id,
            response: Some(response),
        }) => ([(SESSION_ID_HEADER, session_id)], Json(response)).into_response(),
        Ok(Submitted {
            session_id,
            response: None,
        }) => (StatusCode::ACCEPTED, [(SESSION_ID_HEADER, session_id)]).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET - open the SSE push channel.
pub async fn mcp_get(
    State(router): State<Arc<McpRouter>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RouterError> {
    let entries = router
        .open_stream(
            header(&headers, SESSION_ID_HEADER),
            header(&headers, LAST_EVENT_ID_HEADER),
        )
        .await?;

    let events = entries.map(|entry| {
        Ok::<_, Infallible>(
            Event::default()
                .id(entry.event_id.to_string())
                .data(entry.payload.to_string()),
        )
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

/// DELETE - terminate a session.
pub async fn mcp_delete(
    State(router): State<Arc<McpRouter>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, RouterError> {
    let outcome = router.terminate(header(&headers, SESSION_ID_HEADER)).await?;
    let status = match outcome {
        Terminated::Closed => "terminated",
        Terminated::AlreadyGone => "already_gone",
    };
    Ok(Json(json!({ "status": status })))
}

/// GET /health
pub async fn health(State(router): State<Arc<McpRouter>>) -> Json<HealthResponse> {
    Json(router.health().await)
}

/// Build the axum router with the MCP endpoint mounted at `path`.
#[must_use]
pub fn create_router(router: Arc<McpRouter>, path: &str) -> Router {
    Router::new()
        .route(path, get(mcp_get).post(mcp_post).delete(mcp_delete))
        .route("/health", get(health))
        .with_state(router)
}
