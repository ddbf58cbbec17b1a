use crate::live_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use lib_live::{OutboundFrame, SendTarget};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_graceful::ShutdownGuard;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/connections", get(connections_handler))
        .route("/performance/dashboard", get(dashboard_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub async fn run(port: u16, app_state: AppState, shutdown_guard: ShutdownGuard) {
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("Live server listening on {}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_guard.cancelled().await;
        info!("Live server shutting down.");
    });
    if let Err(e) = serve.await {
        error!("Live server error: {}", e);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.connections().stats();
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
        "components": state.registry.stats().total_components,
        "connections": connections.total_connections,
        "healthyConnections": connections.healthy_connections,
    }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "registry": state.registry.stats(),
        "connections": state.connections().stats(),
        "uploads": state.uploads.stats(),
        "backups": state.signer().backup_count(),
    }))
}

async fn connections_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "connections": state.connections().all_connection_metrics(),
        "pools": state.connections().pool_metrics(),
    }))
}

async fn dashboard_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor().generate_dashboard())
}

/// One socket: replies and pushes both leave through the connection's
/// outbound channel, so they reach the client in the order they were queued.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = format!("conn-{}", Uuid::new_v4());
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    state.connections().register_connection(&connection_id, tx, None);
    info!(connection_id = %connection_id, "Client connected");

    let (mut sink, mut stream) = socket.split();

    // Ends when the manager drops the sender or the client goes away.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let replies = state.dispatcher.handle(&connection_id, text.as_str()).await;
                for reply in replies {
                    if !state
                        .connections()
                        .send_message(reply.to_json(), SendTarget::Connection(&connection_id))
                    {
                        debug!(connection_id = %connection_id, "reply dropped, connection gone");
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                state.connections().record_inbound(&connection_id, 0);
            }
            Ok(Message::Binary(bytes)) => {
                warn!(connection_id = %connection_id, len = bytes.len(), "binary frames are not supported");
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(connection_id = %connection_id, "socket error: {}", e);
                break;
            }
        }
    }

    let removed = state.registry.cleanup_connection(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, components = removed, "Client disconnected");
}
