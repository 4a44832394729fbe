//! Relay Coordinator
//!
//! Signaling coordinator for a single-room WebRTC relay.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, `GET /signaling`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start health HTTP server (liveness, readiness, metrics)
//! 4. Create the relay worker and router, install the router
//! 5. Start the session coordinator and the signaling server
//! 6. Wait for a shutdown signal or relay worker death
//!
//! Relay worker death is fatal: the process stops accepting sessions,
//! withdraws readiness and exits with status 1 after a grace delay.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relay_coordinator::actors::{monitor_worker, ActorMetrics, SessionCoordinator};
use relay_coordinator::config::Config;
use relay_coordinator::observability::{health_router, init_metrics_recorder, HealthState};
use relay_coordinator::registry::{Registries, RegistrySettings};
use relay_coordinator::relay::{MediasoupWorker, RelayWorker};
use relay_coordinator::signaling::signaling_router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deadline for session cleanup on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_coordinator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Relay Coordinator");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        listen_ip = %config.listen_ip,
        announced_ip = ?config.announced_ip,
        max_incoming_bitrate = ?config.max_incoming_bitrate,
        relay_call_timeout_ms = u64::try_from(config.relay_call_timeout.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Health server first so probes answer while the relay starts
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Relay worker and router
    let worker = MediasoupWorker::new(&config.worker_settings())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create relay worker");
            format!("Failed to create relay worker: {e}")
        })?;
    let router = worker
        .create_router(&config.media_codecs)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create relay router");
            format!("Failed to create relay router: {e}")
        })?;

    let registries = Registries::new(RegistrySettings::from_config(&config));
    registries.capabilities.install(router);
    health_state.set_router_ready();
    info!("Relay router ready");

    let coordinator = SessionCoordinator::new(registries, ActorMetrics::new());
    let worker_monitor = tokio::spawn(monitor_worker(worker.died(), coordinator.clone()));

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_app = signaling_router(coordinator.clone());
    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    info!("Relay Coordinator running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        reason = worker_monitor => {
            let reason = reason.unwrap_or_else(|e| format!("worker monitor failed: {e}"));
            health_state.set_worker_dead();
            error!(
                reason = %reason,
                grace_ms = u64::try_from(config.worker_death_grace.as_millis()).unwrap_or(u64::MAX),
                "Relay worker died, exiting"
            );
            tokio::time::sleep(config.worker_death_grace).await;
            std::process::exit(1);
        }
    }

    // Stop receiving traffic before tearing sessions down
    health_state.set_not_ready();
    shutdown_token.cancel();

    if let Err(e) = coordinator.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Session coordinator shutdown error");
    }
    coordinator.cancel();

    info!("Relay Coordinator shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
