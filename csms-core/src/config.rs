//! CSMS server configuration

use std::time::Duration;

/// Tunables for the server and its sessions.
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// TCP listen address for charge point WebSocket connections.
    pub listen_addr: String,

    /// Heartbeat cadence answered in BootNotification.conf; also the
    /// WebSocket ping interval.
    pub heartbeat_interval: Duration,

    /// How long an outbound CALL may stay unanswered before the correlation
    /// engine times it out.
    pub request_timeout: Duration,

    /// How long the bridge waits for a station's answer to a delivered
    /// command.
    pub deliver_timeout: Duration,

    /// A session is closed after this many heartbeat intervals of silence.
    pub offline_multiple: u32,

    /// Consecutive malformed frames tolerated before the session is closed.
    pub decode_failure_tolerance: u32,

    /// Depth of each session's command queue (bridge deliveries).
    pub command_queue_depth: usize,

    /// Depth of the audit channel.
    pub audit_buffer: usize,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            deliver_timeout: Duration::from_secs(30),
            offline_multiple: 3,
            decode_failure_tolerance: 5,
            command_queue_depth: 16,
            audit_buffer: 256,
        }
    }
}

impl CsmsConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_deliver_timeout(mut self, timeout: Duration) -> Self {
        self.deliver_timeout = timeout;
        self
    }

    pub fn with_decode_failure_tolerance(mut self, tolerance: u32) -> Self {
        self.decode_failure_tolerance = tolerance;
        self
    }

    /// Silence window after which a session is considered gone.
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * self.offline_multiple
    }
}
