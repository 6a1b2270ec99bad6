//! Prometheus metrics for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Sessions created since start
    pub sessions_total: AtomicU64,
    /// Sessions currently open
    pub active_sessions: AtomicU64,
    /// Inbound requests dispatched
    pub requests_total: AtomicU64,
    /// Requests answered with a result
    pub requests_success: AtomicU64,
    /// Requests answered with an error
    pub requests_failed: AtomicU64,
    /// Requests cancelled by the peer
    pub requests_cancelled: AtomicU64,
    /// Inbound notifications
    pub notifications_total: AtomicU64,
    /// Total handler time in milliseconds
    pub request_duration_ms: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a new open session.
    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed session.
    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Increment requests total.
    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment successful requests.
    pub fn inc_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed requests.
    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment cancelled requests.
    pub fn inc_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment inbound notifications.
    pub fn inc_notifications(&self) {
        self.notifications_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the duration of one handled request.
    pub fn observe_request(&self, timer: &Timer) {
        self.request_duration_ms
            .fetch_add(timer.elapsed_ms(), Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            request_duration_ms: self.request_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP mcp_wire_sessions_total Sessions created
# TYPE mcp_wire_sessions_total counter
mcp_wire_sessions_total {}

# HELP mcp_wire_active_sessions Sessions currently open
# TYPE mcp_wire_active_sessions gauge
mcp_wire_active_sessions {}

# HELP mcp_wire_requests_total Inbound requests dispatched
# TYPE mcp_wire_requests_total counter
mcp_wire_requests_total {}

# HELP mcp_wire_requests_success Requests answered with a result
# TYPE mcp_wire_requests_success counter
mcp_wire_requests_success {}

# HELP mcp_wire_requests_failed Requests answered with an error
# TYPE mcp_wire_requests_failed counter
mcp_wire_requests_failed {}

# HELP mcp_wire_requests_cancelled Requests cancelled by the peer
# TYPE mcp_wire_requests_cancelled counter
mcp_wire_requests_cancelled {}

# HELP mcp_wire_notifications_total Inbound notifications
# TYPE mcp_wire_notifications_total counter
mcp_wire_notifications_total {}

# HELP mcp_wire_request_duration_ms_total Total handler time in milliseconds
# TYPE mcp_wire_request_duration_ms_total counter
mcp_wire_request_duration_ms_total {}
"#,
            s.sessions_total,
            s.active_sessions,
            s.requests_total,
            s.requests_success,
            s.requests_failed,
            s.requests_cancelled,
            s.notifications_total,
            s.request_duration_ms
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub active_sessions: u64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub notifications_total: u64,
    pub request_duration_ms: u64,
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
