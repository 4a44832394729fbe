//! Health endpoints for the Relay Coordinator.
//!
//! - `GET /health`: liveness (process is up)
//! - `GET /ready`: readiness (router installed and relay worker alive)
//!
//! `/metrics` is mounted next to these in `main.rs`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared with the probes.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    /// Set once the relay router is installed.
    router_ready: AtomicBool,
    /// Cleared when the relay worker dies.
    worker_alive: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, worker alive, router not yet installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            router_ready: AtomicBool::new(false),
            worker_alive: AtomicBool::new(true),
        }
    }

    pub fn set_router_ready(&self) {
        self.router_ready.store(true, Ordering::SeqCst);
    }

    /// Mark the relay worker as dead. Readiness never recovers.
    pub fn set_worker_dead(&self) {
        self.worker_alive.store(false, Ordering::SeqCst);
    }

    /// Withdraw readiness during shutdown.
    pub fn set_not_ready(&self) {
        self.router_ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.router_ready.load(Ordering::SeqCst) && self.worker_alive.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready(), "Not ready before the router exists");
    }

    #[test]
    fn test_ready_requires_router_and_live_worker() {
        let state = HealthState::new();

        state.set_router_ready();
        assert!(state.is_ready());

        state.set_worker_dead();
        assert!(!state.is_ready(), "Worker death withdraws readiness");

        // Router readiness alone cannot bring it back
        state.set_router_ready();
        assert!(!state.is_ready());
    }

    #[test]
    fn test_set_not_ready() {
        let state = HealthState::new();
        state.set_router_ready();
        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(status_of(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_router_readiness_transitions() {
        let state = Arc::new(HealthState::new());

        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_router_ready();
        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::OK
        );

        state.set_worker_dead();
        assert_eq!(
            status_of(health_router(state), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_health_router_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(status_of(app, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
