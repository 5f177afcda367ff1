//! Roomwire server orchestration
//!
//! Manages the startup and shutdown of the HTTP/WebSocket server:
//! - Signaling endpoint (`/ws`), health and statistics routes
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Orderly shutdown when the media engine dies

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use roomwire_sfu::{RegistryStats, SignalingGateway};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::ws::websocket_handler;

/// Shared state of every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SignalingGateway>,
    pub server: Arc<ServerConfig>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.gateway.engine_dead().is_cancelled() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "media engine is gone" })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    }
}

async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.gateway.stats().await)
}

/// Why the server stopped
enum StopReason {
    Signal,
    EngineDied,
    HttpStopped,
}

pub struct RoomwireServer {
    config: Config,
    gateway: Arc<SignalingGateway>,
}

impl RoomwireServer {
    #[must_use]
    pub const fn new(config: Config, gateway: Arc<SignalingGateway>) -> Self {
        Self { config, gateway }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Roomwire server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;
        let engine_dead = self.gateway.engine_dead();

        let reason = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                StopReason::HttpStopped
            }
            () = engine_dead.cancelled() => {
                error!("Media engine died, shutting down");
                StopReason::EngineDied
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                StopReason::Signal
            }
        };

        // Signal every connection and the listener to stop
        let _ = shutdown_tx.send(true);

        if !matches!(reason, StopReason::HttpStopped) {
            let drain_timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
            if tokio::time::timeout(drain_timeout, http_handle).await.is_err() {
                warn!(
                    "Drain timeout reached after {}s, proceeding with shutdown",
                    drain_timeout.as_secs()
                );
            }
        }

        let remaining = self.gateway.registry().room_count();
        if remaining > 0 {
            warn!(rooms = remaining, "Rooms still open at shutdown");
        }
        info!("Roomwire server stopped");

        match reason {
            StopReason::Signal => Ok(()),
            StopReason::EngineDied => Err(anyhow::anyhow!("media engine terminated")),
            StopReason::HttpStopped => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
        }
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_addr: std::net::SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{}': {e}", self.config.http_address()))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let router = create_router(AppState {
            gateway: Arc::clone(&self.gateway),
            server: Arc::new(self.config.server.clone()),
            shutdown: shutdown_rx.clone(),
        });

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
