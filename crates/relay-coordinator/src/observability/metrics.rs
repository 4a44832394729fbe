//! Metrics definitions for the Relay Coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: 8 signaling operations plus `unknown`
//! - `status`: `ok` or a wire error code (13 values)
//! - `operation`: relay trait methods (11 values)
//! - `actor_type`: 2 values (coordinator, session)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Relay calls are local IPC, bounded by the relay call timeout
        .set_buckets_for_metric(
            Matcher::Prefix("rc_relay_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set relay call buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rc_signaling_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics (Gauges)
// ============================================================================

/// Set the number of connected signaling sessions.
///
/// Metric: `rc_sessions_active`
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_sessions_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rc_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handled signaling request.
///
/// Metrics: `rc_signaling_requests_total{method,status}` and
/// `rc_signaling_request_duration_seconds{method}`.
pub fn record_signaling_request(method: &str, status: &str, duration: Duration) {
    counter!("rc_signaling_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("rc_signaling_request_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Relay Metrics
// ============================================================================

/// Record a relay engine call.
///
/// Metric: `rc_relay_call_duration_seconds`
/// Labels: `operation`, `status` (success, error)
pub fn record_relay_call(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    histogram!("rc_relay_call_duration_seconds",
        "operation" => operation.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Record a producer being replaced by a newer one.
///
/// Metric: `rc_producer_replacements_total`
pub fn record_producer_replacement() {
    counter!("rc_producer_replacements_total").increment(1);
}

// ============================================================================
// Notification Metrics
// ============================================================================

/// Record a notification dropped because the subscriber mailbox was full
/// or closed.
///
/// Metric: `rc_notifications_dropped_total`
/// Labels: `method`
pub fn record_notification_dropped(method: &str) {
    counter!("rc_notifications_dropped_total", "method" => method.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `rc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These execute against the global no-op recorder; no values are asserted.

    #[test]
    fn test_set_sessions_active() {
        set_sessions_active(0);
        set_sessions_active(1);
        set_sessions_active(250);
    }

    #[test]
    fn test_set_actor_mailbox_depth() {
        set_actor_mailbox_depth("session", 0);
        set_actor_mailbox_depth("session", 64);
    }

    #[test]
    fn test_record_signaling_request() {
        record_signaling_request("produce", "ok", Duration::from_millis(4));
        record_signaling_request("consume", "NoActiveProducer", Duration::from_micros(300));
        record_signaling_request("unknown", "InvalidRequest", Duration::ZERO);
    }

    #[test]
    fn test_record_relay_call() {
        record_relay_call("create_webrtc_transport", true, Duration::from_millis(2));
        record_relay_call("consume", false, Duration::from_secs(10));
    }

    #[test]
    fn test_counters() {
        record_producer_replacement();
        record_notification_dropped("newProducer");
        record_actor_panic("session");
    }
}
