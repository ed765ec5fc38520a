use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use grain_broker::Broker;
use grain_telemetry::{names, MetricsRecorder};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::client;
use crate::config::{HubConfig, ServerConfig};
use crate::error::ServerError;
use crate::manager::ConnectionManager;

/// Header consulted when the `username` query parameter is absent.
pub const USERNAME_HEADER: &str = "x-username";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
    pub broker: Arc<dyn Broker>,
    pub metrics: Arc<MetricsRecorder>,
    pub hub: HubConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub username: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub shards: usize,
    pub connections: usize,
    pub per_shard: Vec<usize>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start the hubs and bridges, and serve. Returns once listening.
pub async fn start(
    config: ServerConfig,
    broker: Arc<dyn Broker>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let (manager, tasks) =
        ConnectionManager::start(&config.hub, Arc::clone(&broker), Arc::clone(&metrics)).await?;

    let state = AppState {
        manager: manager.clone(),
        broker,
        metrics,
        hub: config.hub.clone(),
    };
    let router = build_router(state);

    info!(
        port = local_addr.port(),
        shards = manager.hubs().len(),
        "grain server started"
    );

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        manager,
        server,
        tasks,
    })
}

/// Handle returned by `start()`. Keeps background tasks reachable.
pub struct ServerHandle {
    pub port: u16,
    manager: ConnectionManager,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Stop accepting, then stop every hub and bridge.
    pub fn shutdown(self) {
        self.server.abort();
        for task in &self.tasks {
            task.abort();
        }
        info!(port = self.port, "grain server stopped");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let username = resolve_username(params.username, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, username, state))
}

/// First non-blank of the query parameter and the header.
fn resolve_username(query: Option<String>, headers: &HeaderMap) -> Option<String> {
    query
        .filter(|u| !u.trim().is_empty())
        .or_else(|| {
            headers
                .get(USERNAME_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|u| !u.trim().is_empty())
                .map(str::to_owned)
        })
}

async fn handle_socket(socket: WebSocket, username: Option<String>, state: AppState) {
    let username = username.unwrap_or_default();
    let hub = match state.manager.assign(&username) {
        Ok(hub) => hub.clone(),
        Err(e) => {
            reject(socket, &e, &state.metrics).await;
            return;
        }
    };

    if let Err(e) = client::serve_connection(
        socket,
        username.clone(),
        hub,
        state.broker,
        state.hub,
        state.metrics,
    )
    .await
    {
        warn!(username = %username, error = %e, "connection setup failed");
    }
}

/// Close an upgraded socket that never gets registered.
async fn reject(mut socket: WebSocket, reason: &ServerError, metrics: &MetricsRecorder) {
    metrics.counter_inc(
        names::WS_HANDSHAKE_REJECTED_TOTAL,
        &[("reason", reason.reason())],
        1,
    );
    info!(error = %reason, "rejecting connection");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("username is required"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.member_counts().await {
        Ok(per_shard) => {
            let health = Health {
                status: "ok".into(),
                shards: per_shard.len(),
                connections: per_shard.iter().sum(),
                per_shard,
            };
            (StatusCode::OK, Json(health))
        }
        Err(e) => {
            warn!(error = %e, "health check failed");
            let health = Health {
                status: "degraded".into(),
                shards: state.manager.hubs().len(),
                connections: 0,
                per_shard: Vec::new(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(health))
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use grain_broker::MemoryBroker;
    use grain_telemetry::MetricSample;

    fn config(shards: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            hub: HubConfig {
                shards,
                ..HubConfig::default()
            },
        }
    }

    #[test]
    fn username_from_query_then_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_username(None, &headers), None);
        assert_eq!(resolve_username(Some("  ".into()), &headers), None);

        headers.insert(USERNAME_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(
            resolve_username(None, &headers).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            resolve_username(Some("".into()), &headers).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            resolve_username(Some("alice".into()), &headers).as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(
            config(3),
            Arc::new(MemoryBroker::new()),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let health: Health = resp.json().await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.shards, 3);
        assert_eq!(health.connections, 0);
        assert_eq!(health.per_shard, vec![0, 0, 0]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn stats_endpoint_returns_snapshot() {
        let metrics = Arc::new(MetricsRecorder::new());
        metrics.counter_inc(names::BUS_PUBLISHED_TOTAL, &[], 4);
        let handle = start(config(1), Arc::new(MemoryBroker::new()), Arc::clone(&metrics))
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/stats", handle.port);
        let samples: Vec<MetricSample> = reqwest::get(&url).await.unwrap().json().await.unwrap();
        let published = samples
            .iter()
            .find(|s| s.name == names::BUS_PUBLISHED_TOTAL)
            .unwrap();
        assert_eq!(published.value, 4.0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_not_upgraded() {
        let handle = start(
            config(1),
            Arc::new(MemoryBroker::new()),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .unwrap();

        let url = format!("http://127.0.0.1:{}/ws?username=alice", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_eq!(handle.manager().total_members().await.unwrap(), 0);
        handle.shutdown();
    }
}
