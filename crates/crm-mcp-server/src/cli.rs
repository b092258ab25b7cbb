//! Command line and environment configuration.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use crm_mcp_core::{EventLogConfig, SessionConfig};
use crm_mcp_executor::{CrmConfig, catalog::DEFAULT_DOMAINS};

/// CRM MCP gateway - Streamable HTTP MCP server exposing CRM CRUD tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "CRM_MCP_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Path the MCP endpoint is mounted at
    #[arg(long, env = "CRM_MCP_PATH", default_value = "/mcp")]
    pub path: String,

    /// Base URL of the CRM API
    #[arg(long, env = "CRM_API_BASE_URL", default_value = "http://127.0.0.1:8080")]
    pub api_base_url: String,

    /// Bearer token for the CRM API
    #[arg(long, env = "CRM_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Timeout for a single CRM request, in seconds
    #[arg(long, env = "CRM_API_TIMEOUT_SECS", default_value_t = 30)]
    pub api_timeout_secs: u64,

    /// CRM domains exposed as tools (comma separated)
    #[arg(long, env = "CRM_MCP_DOMAINS", value_delimiter = ',', default_values = DEFAULT_DOMAINS)]
    pub domains: Vec<String>,

    /// Idle time after which a session is reaped, in seconds
    #[arg(long, env = "CRM_MCP_SESSION_TIMEOUT_SECS", default_value_t = 600)]
    pub session_timeout_secs: u64,

    /// Interval between reaper passes, in seconds
    #[arg(long, env = "CRM_MCP_REAPER_INTERVAL_SECS", default_value_t = 60)]
    pub reaper_interval_secs: u64,

    /// Heartbeat interval for active sessions, in seconds
    #[arg(long, env = "CRM_MCP_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// How long event log entries are kept for resumption, in seconds
    #[arg(long, env = "CRM_MCP_EVENT_RETENTION_SECS", default_value_t = 1800)]
    pub event_retention_secs: u64,

    /// Maximum event log entries kept per session
    #[arg(long, env = "CRM_MCP_EVENT_MAX_ENTRIES", default_value_t = 1000)]
    pub event_max_entries: usize,

    /// Time allowed for closing sessions on shutdown, in seconds
    #[arg(long, env = "CRM_MCP_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

impl Cli {
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            session_timeout_secs: self.session_timeout_secs,
            reaper_interval_secs: self.reaper_interval_secs,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            event_log: EventLogConfig {
                retention_secs: self.event_retention_secs,
                max_entries: self.event_max_entries,
            },
        }
    }

    #[must_use]
    pub fn crm_config(&self) -> CrmConfig {
        CrmConfig {
            base_url: self.api_base_url.clone(),
            api_token: self.api_token.clone(),
            timeout_secs: self.api_timeout_secs,
        }
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
