#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use grain_broker::Broker;
use grain_core::Envelope;
use grain_server::manager::shard_for;
use grain_server::{HubConfig, ServerConfig, ServerHandle};
use grain_telemetry::MetricsRecorder;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn spawn_server(broker: Arc<dyn Broker>, shards: usize) -> ServerHandle {
    spawn_server_with(broker, shards, Arc::new(MetricsRecorder::new())).await
}

pub async fn spawn_server_with(
    broker: Arc<dyn Broker>,
    shards: usize,
    metrics: Arc<MetricsRecorder>,
) -> ServerHandle {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        hub: HubConfig {
            shards,
            ..HubConfig::default()
        },
    };
    grain_server::start(config, broker, metrics).await.unwrap()
}

pub async fn connect(port: u16, username: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws?username={username}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn connect_anonymous(port: u16) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Poll until the server has `n` registered members.
pub async fn wait_for_members(handle: &ServerHandle, n: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if handle.manager().total_members().await.unwrap() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("server never reached {n} members"));
}

pub async fn send(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next chat frame, skipping keepalive traffic.
pub async fn next_envelope(ws: &mut Ws) -> Envelope {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Envelope::decode(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

/// True if no chat frame arrives within `window`.
pub async fn stays_quiet(ws: &mut Ws, window: Duration) -> bool {
    tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                _ => return,
            }
        }
    })
    .await
    .is_err()
}

/// A username that does not land on the same shard as `other`.
pub fn name_on_other_shard(other: &str, shards: usize) -> String {
    let taken = shard_for(other, shards);
    (0..)
        .map(|i| format!("user{i}"))
        .find(|name| shard_for(name, shards) != taken)
        .unwrap()
}
