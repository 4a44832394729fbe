//! Observability for the Relay Coordinator.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicitly listed
//! fields. Relay blobs (ICE, DTLS, RTP) are never logged.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rc_sessions_active` | Gauge | none | Connected signaling sessions |
//! | `rc_signaling_requests_total` | Counter | `method`, `status` | Requests by outcome |
//! | `rc_relay_call_duration_seconds` | Histogram | `operation`, `status` | Relay engine latency |
//! | `rc_producer_replacements_total` | Counter | none | Producer slot replacements |
//! | `rc_notifications_dropped_total` | Counter | `method` | Best-effort delivery losses |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
