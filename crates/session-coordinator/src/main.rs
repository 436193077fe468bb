//! TuneTogether Session Coordinator
//!
//! Stateful WebSocket server for real-time music collaboration.
//!
//! # Servers
//!
//! A single HTTP server (default: 0.0.0.0:8080) carries everything:
//! - `GET /ws` - WebSocket upgrade for collaboration clients
//! - `GET /health`, `GET /ready` - Kubernetes probes
//! - `GET /metrics` - Prometheus metrics
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the SQLite project store
//! 4. Initialize actor system (`CoordinatorActorHandle`)
//! 5. Bind the listener, then mark ready
//! 6. Wait for shutdown signal, drain sessions, exit

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::auth::Authenticator;
use common::secret::ExposeSecret;
use metrics_exporter_prometheus::PrometheusBuilder;
use session_coordinator::actors::{ActorMetrics, CoordinatorActorHandle};
use session_coordinator::config::Config;
use session_coordinator::observability::{health_router, metrics_router, HealthState};
use session_coordinator::store::sqlite::SqliteProjectStore;
use session_coordinator::store::SharedProjectStore;
use session_coordinator::ws::{ws_router, AppState};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_coordinator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TuneTogether Session Coordinator");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        shutdown_deadline_seconds = config.shutdown_deadline_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Connect the project store
    info!("Connecting project store...");
    let store = SqliteProjectStore::connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect project store");
            e
        })?;
    let store: SharedProjectStore = Arc::new(store);
    info!("Project store connected");

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let coordinator = CoordinatorActorHandle::new(Arc::clone(&store), Arc::clone(&actor_metrics));
    info!("Actor system initialized");

    // Create shutdown token as child of the coordinator's token so
    // cancelling the coordinator also stops the server
    let shutdown_token = coordinator.child_token();

    let authenticator = Arc::new(Authenticator::new(&config.jwt_secret));

    let app_state = AppState {
        coordinator: coordinator.clone(),
        authenticator,
    };

    let app = ws_router(app_state)
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router(prometheus_handle))
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind server");
        format!("Failed to bind server to {addr}: {e}")
    })?;
    info!(addr = %addr, "Server bound successfully");

    // Ready only once the listener is accepting
    health_state.set_ready();

    let server_shutdown_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        info!(addr = %addr, "Server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    // Wait for shutdown signal
    info!("Session coordinator running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop taking traffic immediately, then drain sessions
    health_state.set_not_ready();

    let deadline = Duration::from_secs(config.shutdown_deadline_seconds);
    match tokio::time::timeout(deadline, coordinator.shutdown()).await {
        Ok(Ok(())) => info!("Sessions drained"),
        Ok(Err(e)) => warn!(error = %e, "Actor system shutdown error"),
        Err(_) => warn!(
            deadline_seconds = config.shutdown_deadline_seconds,
            "Sessions did not drain within the shutdown deadline"
        ),
    }

    shutdown_token.cancel();
    let _ = server.await;

    info!("Session coordinator shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[expect(
        clippy::expect_used,
        reason = "failure to install signal handlers is unrecoverable at startup"
    )]
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    #[expect(
        clippy::expect_used,
        reason = "failure to install signal handlers is unrecoverable at startup"
    )]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
