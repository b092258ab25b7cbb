//! `/health` endpoint body.

use crm_mcp_session::TableStats;
use serde::Serialize;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the router was created.
    pub uptime_secs: u64,
    /// Sessions in the `Active` state.
    pub active_sessions: usize,
    /// Every session in the table, whatever its state.
    pub total_sessions: usize,
    pub average_session_age_secs: f64,
    /// Whether the shared MCP server has been constructed.
    pub server_initialized: bool,
}

/// Build a health response from live counters.
#[must_use]
pub fn health_check(start_time: Instant, stats: TableStats, server_initialized: bool) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions: stats.active_sessions,
        total_sessions: stats.total_sessions,
        average_session_age_secs: stats.average_session_age_secs,
        server_initialized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(active: usize, total: usize) -> TableStats {
        TableStats {
            active_sessions: active,
            total_sessions: total,
            average_session_age_secs: 0.0,
        }
    }

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), stats(0, 0), false);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_follows_runtime_clock() {
        let start = Instant::now();
        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        let resp = health_check(start, stats(0, 0), true);
        assert_eq!(resp.uptime_secs, 60);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), stats(2, 3), true);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["active_sessions"], 2);
        assert_eq!(parsed["total_sessions"], 3);
        assert_eq!(parsed["server_initialized"], true);
        assert!(parsed["average_session_age_secs"].is_number());
    }
}
