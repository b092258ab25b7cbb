//! Core traits for execution and session transports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error returned by the CRM execution capability.
///
/// Forwarded to the client as-is; the gateway never interprets it.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{error_kind}: {message}")]
pub struct ExecutionError {
    /// Stable, machine-readable error category (e.g. `"not_found"`).
    pub error_kind: String,
    /// Human readable message.
    pub message: String,
    /// Upstream HTTP status, when the failure came from an HTTP response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl ExecutionError {
    /// Create an error without an upstream status.
    #[must_use]
    pub fn new(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_kind: error_kind.into(),
            message: message.into(),
            http_status: None,
        }
    }

    /// Attach the upstream HTTP status.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

/// The external collaborator that performs CRM operations.
///
/// Implement this trait to plug in a concrete CRM client. The gateway only
/// forwards `params` and the returned value.
#[async_trait]
pub trait ExecutionCapability: Send + Sync {
    /// Execute `operation` within `domain` with the given parameters.
    async fn execute(
        &self,
        domain: &str,
        operation: &str,
        params: Value,
    ) -> Result<Value, ExecutionError>;
}

/// Stream-level failure on a session transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Stream subscriber lagged, {0} messages dropped")]
    Lagged(u64),
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Session-side view of a transport, as seen by the session table.
#[async_trait]
pub trait SessionStream: Send + Sync + 'static {
    /// Liveness probe run by the session heartbeat.
    ///
    /// `Ok(true)` means a push channel is connected and the session should be
    /// kept alive, `Ok(false)` means nothing is connected right now.
    ///
    /// # Errors
    /// Returns error if the transport is no longer usable.
    async fn heartbeat(&self) -> Result<bool, TransportError>;

    /// Release the transport. Called once, during session teardown.
    ///
    /// # Errors
    /// Returns error if the transport was already released.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Receiver of server-initiated notifications for one session.
pub trait NotificationSink: Send + Sync {
    /// Queue a JSON-RPC notification for delivery to the client.
    fn notify(&self, method: &str, params: Value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_serializes_camel_case() {
        let err = ExecutionError::new("not_found", "Contact 42 not found").with_status(404);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["errorKind"], "not_found");
        assert_eq!(json["message"], "Contact 42 not found");
        assert_eq!(json["httpStatus"], 404);
    }

    #[test]
    fn execution_error_omits_missing_status() {
        let err = ExecutionError::new("invalid_params", "missing id");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("httpStatus").is_none());
        assert_eq!(err.to_string(), "invalid_params: missing id");
    }
}
