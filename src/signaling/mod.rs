#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod router;

pub use liveness::LivenessMonitor;
pub use registry::{Connection, ConnectionRegistry};
pub use router::SignalingRouter;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    signaling: SignalingRouter,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    heartbeat_interval: Duration,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(room_manager: Arc<RoomManager>, metrics: ServerMetrics, config: &ServerConfig) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            signaling: SignalingRouter::new(room_manager.clone(), registry, metrics.clone()),
            room_manager,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            heartbeat_interval: config.heartbeat_interval,
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.signaling.registry()
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("Signaling server listening on {}", addr);
        self.serve_on(listener).await
    }

    /// Serves on an already bound listener, running the heartbeat alongside
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let liveness = LivenessMonitor::new(
            self.registry().clone(),
            self.metrics.clone(),
            self.heartbeat_interval,
        )
        .spawn();

        let app = self.router();
        let result = axum::serve(listener, app).await;
        liveness.abort();

        result?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.participant_count();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by METRICS_TOKEN (Bearer auth) when configured.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.signaling, server.metrics, permit)
        })
}
