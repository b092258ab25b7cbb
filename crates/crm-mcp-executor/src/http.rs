//! HTTP client for the CRM API.

use std::time::Duration;

use async_trait::async_trait;
use crm_mcp_core::{ExecutionCapability, ExecutionError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Connection settings for the CRM API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Base URL of the CRM API, e.g. `https://api.example-crm.com/v3`.
    pub base_url: String,
    /// Bearer token. Required.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            api_token: None,
            timeout_secs: 30,
        }
    }
}

/// Error building the capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Execution capability that forwards every call to the CRM over HTTP.
///
/// `execute(domain, operation, params)` becomes
/// `POST {base_url}/{domain}/{operation}` with `params` as the JSON body.
#[derive(Clone, Debug)]
pub struct HttpCapability {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpCapability {
    /// Build the capability from configuration.
    ///
    /// # Errors
    /// Returns error if the token is missing, the base URL is not http(s),
    /// or the HTTP client cannot be built.
    pub fn from_config(config: &CrmConfig) -> Result<Self, CapabilityError> {
        let token = config
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CapabilityError::MissingCredential("CRM API token"))?;

        let base_url = config.base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(CapabilityError::InvalidBaseUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            base_url: base_url.to_string(),
            token: token.to_string(),
            client,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Domain and operation names become URL path segments.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn error_kind(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 | 422 => "invalid_request",
        401 | 403 => "unauthorized",
        404 => "not_found",
        409 => "conflict",
        429 => "rate_limited",
        500..=599 => "upstream_error",
        _ => "http_error",
    }
}

fn error_message(status: StatusCode, body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map_or_else(|| format!("CRM request failed with status {status}"), str::to_string)
}

#[async_trait]
impl ExecutionCapability for HttpCapability {
    async fn execute(
        &self,
        domain: &str,
        operation: &str,
        params: Value,
    ) -> Result<Value, ExecutionError> {
        if !valid_segment(domain) || !valid_segment(operation) {
            return Err(ExecutionError::new(
                "invalid_request",
                format!("Invalid domain or operation: {domain}/{operation}"),
            ));
        }

        let url = format!("{}/{domain}/{operation}", self.base_url);
        tracing::debug!(domain, operation, "Executing CRM operation");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&params)
            .send()
            .await
            .map_err(|e| ExecutionError::new("network_error", e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::new("network_error", e.to_string()).with_status(status.as_u16()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            Ok(body)
        } else {
            tracing::warn!(domain, operation, %status, "CRM operation failed");
            Err(ExecutionError::new(error_kind(status), error_message(status, &body))
                .with_status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(token: Option<&str>) -> CrmConfig {
        CrmConfig {
            base_url: "https://crm.example.com/api/".into(),
            api_token: token.map(str::to_string),
            timeout_secs: 5,
        }
    }

    #[test]
    fn missing_token_is_rejected() {
        let err = HttpCapability::from_config(&config(None)).unwrap_err();
        assert!(matches!(err, CapabilityError::MissingCredential(_)));

        let err = HttpCapability::from_config(&config(Some("  "))).unwrap_err();
        assert!(matches!(err, CapabilityError::MissingCredential(_)));
    }

    #[test]
    fn base_url_is_normalized() {
        let capability = HttpCapability::from_config(&config(Some("secret"))).unwrap();
        assert_eq!(capability.base_url(), "https://crm.example.com/api");
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        let mut cfg = config(Some("secret"));
        cfg.base_url = "ftp://crm".into();
        assert!(matches!(
            HttpCapability::from_config(&cfg),
            Err(CapabilityError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(error_kind(StatusCode::NOT_FOUND), "not_found");
        assert_eq!(error_kind(StatusCode::TOO_MANY_REQUESTS), "rate_limited");
        assert_eq!(error_kind(StatusCode::BAD_GATEWAY), "upstream_error");
        assert_eq!(error_kind(StatusCode::IM_A_TEAPOT), "http_error");
    }

    #[test]
    fn error_message_prefers_upstream_message() {
        let body = json!({"message": "Contact does not exist"});
        assert_eq!(error_message(StatusCode::NOT_FOUND, &body), "Contact does not exist");
        assert!(error_message(StatusCode::NOT_FOUND, &Value::Null).contains("404"));
    }

    #[test]
    fn token_is_not_serialized() {
        let json = serde_json::to_value(config(Some("secret"))).unwrap();
        assert!(json.get("api_token").is_none());
    }

    #[tokio::test]
    async fn path_traversal_is_rejected_before_sending() {
        let capability = HttpCapability::from_config(&config(Some("secret"))).unwrap();
        let result = capability
            .execute("contacts/../admin", "delete", json!({}))
            .await;
        let err = tokio_test::assert_err!(result);
        assert_eq!(err.error_kind, "invalid_request");
        assert!(err.http_status.is_none());
    }
}
