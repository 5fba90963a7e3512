//! Observability and Metrics
//!
//! Per-connection counters for dispatch, authentication and transport
//! activity. Each [`Connection`](crate::service::connection::Connection) owns
//! one [`Metrics`] behind an `Arc`; there is no process-wide collector.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one LDAP connection
#[derive(Debug)]
pub struct Metrics {
    /// Requests written to the stream
    pub operations_issued: AtomicU64,
    /// Responses delivered to a pending request
    pub responses_routed: AtomicU64,
    /// Responses with no pending request (abandoned, expired or unknown)
    pub responses_discarded: AtomicU64,
    /// Messages with ID 0
    pub unsolicited_notifications: AtomicU64,
    /// Abandon requests sent
    pub abandons: AtomicU64,
    /// Pending requests completed with a timeout
    pub timeouts: AtomicU64,
    /// Bind attempts (simple and SASL)
    pub binds_total: AtomicU64,
    /// Successful binds
    pub binds_success: AtomicU64,
    /// Failed binds
    pub binds_failed: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Frames that failed BER decoding
    pub decode_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            operations_issued: AtomicU64::new(0),
            responses_routed: AtomicU64::new(0),
            responses_discarded: AtomicU64::new(0),
            unsolicited_notifications: AtomicU64::new(0),
            abandons: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            binds_total: AtomicU64::new(0),
            binds_success: AtomicU64::new(0),
            binds_failed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a request frame written to the stream
    pub fn operation_issued(&self, byte_count: u64) {
        self.operations_issued.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn response_routed(&self) {
        self.responses_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_discarded(&self) {
        self.responses_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_received(&self) {
        self.unsolicited_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandon_sent(&self) {
        self.abandons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bind attempt
    pub fn bind_attempt(&self) {
        self.binds_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful bind
    pub fn bind_success(&self) {
        self.binds_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed bind
    pub fn bind_failed(&self) {
        self.binds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_issued: self.operations_issued.load(Ordering::Relaxed),
            responses_routed: self.responses_routed.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            unsolicited_notifications: self.unsolicited_notifications.load(Ordering::Relaxed),
            abandons: self.abandons.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            binds_total: self.binds_total.load(Ordering::Relaxed),
            binds_success: self.binds_success.load(Ordering::Relaxed),
            binds_failed: self.binds_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            operations_issued = snapshot.operations_issued,
            responses_routed = snapshot.responses_routed,
            responses_discarded = snapshot.responses_discarded,
            unsolicited_notifications = snapshot.unsolicited_notifications,
            abandons = snapshot.abandons,
            timeouts = snapshot.timeouts,
            binds_total = snapshot.binds_total,
            binds_success = snapshot.binds_success,
            binds_failed = snapshot.binds_failed,
            bytes_sent = snapshot.bytes_sent,
            decode_errors = snapshot.decode_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations_issued: u64,
    pub responses_routed: u64,
    pub responses_discarded: u64,
    pub unsolicited_notifications: u64,
    pub abandons: u64,
    pub timeouts: u64,
    pub binds_total: u64,
    pub binds_success: u64,
    pub binds_failed: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.operation_issued(12);
        metrics.operation_issued(30);
        metrics.response_routed();
        metrics.response_discarded();
        metrics.bind_attempt();
        metrics.bind_failed();

        let snap = metrics.snapshot();
        assert_eq!(snap.operations_issued, 2);
        assert_eq!(snap.bytes_sent, 42);
        assert_eq!(snap.responses_routed, 1);
        assert_eq!(snap.responses_discarded, 1);
        assert_eq!(snap.binds_total, 1);
        assert_eq!(snap.binds_failed, 1);
        assert_eq!(snap.binds_success, 0);
    }

    #[test]
    fn test_timer_drop_is_silent() {
        let _timer = Timer::start("search");
    }
}
