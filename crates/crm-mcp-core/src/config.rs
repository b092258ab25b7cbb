//! Session and event log configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retention limits for a session's event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Entries older than this are dropped (default 30 minutes).
    pub retention_secs: u64,
    /// Maximum number of retained entries (default 1000).
    pub max_entries: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention_secs: 30 * 60,
            max_entries: 1000,
        }
    }
}

impl EventLogConfig {
    /// Retention window as a `Duration`.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Lifecycle timings for the session table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is reaped (default 10 minutes).
    pub session_timeout_secs: u64,
    /// Interval between reaper passes (default 60 seconds).
    pub reaper_interval_secs: u64,
    /// Heartbeat interval for active sessions (default 30 seconds).
    pub heartbeat_interval_secs: u64,
    /// Event log retention applied to every new session.
    pub event_log: EventLogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 10 * 60,
            reaper_interval_secs: 60,
            heartbeat_interval_secs: 30,
            event_log: EventLogConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Reaper interval, clamped to at least one second.
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Heartbeat interval, clamped to at least one second.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.session_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.reaper_interval(), Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.event_log.retention(), Duration::from_secs(1800));
        assert_eq!(cfg.event_log.max_entries, 1000);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let cfg = SessionConfig {
            reaper_interval_secs: 0,
            heartbeat_interval_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.reaper_interval(), Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{"session_timeout_secs":120,"event_log":{"max_entries":5}}"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.session_timeout_secs, 120);
        assert_eq!(cfg.reaper_interval_secs, 60);
        assert_eq!(cfg.event_log.max_entries, 5);
        assert_eq!(cfg.event_log.retention_secs, 1800);
    }
}
