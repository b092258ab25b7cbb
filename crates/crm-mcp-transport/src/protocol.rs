//! JSON-RPC 2.0 envelope used by the MCP transport.
//!
//! Payloads stay opaque `Value`s; only the envelope is typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// MCP protocol versions this server understands, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method that starts a session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Standard JSON-RPC error codes.
pub mod codes {
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Malformed client payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported JSON-RPC version: {0}")]
    Version(String),
    #[error("Message is neither a request, a notification nor a response")]
    Shape,
}

/// Any message a client may POST: request, notification or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ClientMessage {
    /// Parse and validate a POST body.
    ///
    /// # Errors
    /// Returns error if the body is not a single JSON-RPC 2.0 message.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(body)?;
        if message.jsonrpc != "2.0" {
            return Err(ProtocolError::Version(message.jsonrpc));
        }
        let is_response = message.id.is_some() && (message.result.is_some() || message.error.is_some());
        if message.method.is_none() && !is_response {
            return Err(ProtocolError::Shape);
        }
        Ok(message)
    }

    /// Build a request.
    #[must_use]
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Whether this is an `initialize` request.
    #[must_use]
    pub fn is_initialize(&self) -> bool {
        self.id.is_some() && self.method() == Some(INITIALIZE_METHOD)
    }

    /// Requests carry both an id and a method and expect a reply.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcNotification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// Log severity for `notifications/message`, ordered least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_initialize_request() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26"}
        });
        let msg = ClientMessage::parse(body.to_string().as_bytes()).unwrap();
        assert!(msg.is_initialize());
        assert!(msg.is_request());
    }

    #[test]
    fn notification_is_not_initialize() {
        let body = br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let msg = ClientMessage::parse(body).unwrap();
        assert!(!msg.is_initialize());
        assert!(!msg.is_request());
    }

    #[test]
    fn client_response_is_accepted() {
        let body = br#"{"jsonrpc":"2.0","id":"srv-1","result":{}}"#;
        let msg = ClientMessage::parse(body).unwrap();
        assert!(msg.method().is_none());
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(ClientMessage::parse(b"not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            ClientMessage::parse(br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#),
            Err(ProtocolError::Version(_))
        ));
        assert!(matches!(
            ClientMessage::parse(br#"{"jsonrpc":"2.0","id":1}"#),
            Err(ProtocolError::Shape)
        ));
    }

    #[test]
    fn error_response_serialization() {
        let resp = JsonRpcResponse::error(Some(json!(7)), codes::METHOD_NOT_FOUND, "Method not found");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Error);
        let parsed: LogLevel = serde_json::from_value(json!("warning")).unwrap();
        assert_eq!(parsed, LogLevel::Warning);
    }
}
