use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use grain_broker::Broker;
use grain_core::{ConnectionId, Envelope};
use grain_telemetry::{names, MetricsRecorder};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;
use crate::error::ServerError;
use crate::history;
use crate::hub::{Frame, HubHandle, Registration};

/// Why a connection ended. Only the first cause is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCause {
    ClientClosed,
    ReadFailed,
    WriteFailed,
    PingTimeout,
    /// The hub dropped the queue because it overflowed.
    Evicted,
}

impl CloseCause {
    /// Close code sent to the peer. A failed write gets no close frame.
    pub fn close_code(self) -> Option<u16> {
        match self {
            Self::ClientClosed => Some(close_code::NORMAL),
            Self::ReadFailed | Self::PingTimeout => Some(close_code::ERROR),
            Self::Evicted => Some(close_code::AGAIN),
            Self::WriteFailed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadFailed => "read_failed",
            Self::WriteFailed => "write_failed",
            Self::PingTimeout => "ping_timeout",
            Self::Evicted => "evicted",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::ClientClosed => "bye",
            Self::ReadFailed => "read error",
            Self::WriteFailed => "write error",
            Self::PingTimeout => "ping timeout",
            Self::Evicted => "too slow, try again later",
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by the two pumps of one connection.
///
/// The client does not own its membership entry; it only knows the hub's
/// address so it can ask for removal on teardown.
pub struct Client {
    id: ConnectionId,
    username: String,
    hub: HubHandle,
    cancel: CancellationToken,
    closed: AtomicBool,
    cause: OnceLock<CloseCause>,
    /// When the peer last answered with a pong.
    last_pong: watch::Sender<Instant>,
    metrics: Arc<MetricsRecorder>,
}

impl Client {
    pub fn new(
        id: ConnectionId,
        username: impl Into<String>,
        hub: HubHandle,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            hub,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            cause: OnceLock::new(),
            last_pong: watch::channel(Instant::now()).0,
            metrics,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn cause(&self) -> Option<CloseCause> {
        self.cause.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record_pong(&self) {
        self.last_pong.send_replace(Instant::now());
    }

    /// Tear the connection down. Returns `false` if it was already closing.
    pub async fn close(&self, cause: CloseCause) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.cause.set(cause);
        self.cancel.cancel();

        if let Err(e) = self.hub.unregister(self.id.clone()).await {
            debug!(conn_id = %self.id, error = %e, "unregister skipped");
        }
        self.metrics
            .counter_inc(names::WS_DISCONNECTIONS_TOTAL, &[("cause", cause.as_str())], 1);
        info!(
            conn_id = %self.id,
            username = %self.username,
            hub_id = %self.hub.id(),
            cause = %cause,
            "client disconnected"
        );
        true
    }
}

/// Accept an upgraded socket: replay history into a fresh queue, register
/// with the hub, then spawn the two pumps.
pub async fn serve_connection(
    socket: WebSocket,
    username: String,
    hub: HubHandle,
    broker: Arc<dyn Broker>,
    config: HubConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<(), ServerError> {
    let id = ConnectionId::new();
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);

    let replayed = history::replay(
        broker.as_ref(),
        &config.history_key,
        config.history_limit,
        &queue_tx,
    )
    .await;
    metrics.counter_inc(names::HISTORY_REPLAYED_TOTAL, &[], replayed as u64);

    hub.register(Registration {
        id: id.clone(),
        username: username.clone(),
        queue: queue_tx,
    })
    .await?;
    info!(
        conn_id = %id,
        username = %username,
        hub_id = %hub.id(),
        shard = hub.shard(),
        replayed,
        "client connected"
    );

    let client = Arc::new(Client::new(id, username, hub, metrics));
    let (sink, stream) = socket.split();
    tokio::spawn(send_pump(
        Arc::clone(&client),
        sink,
        queue_rx,
        config.ping_interval,
        config.write_wait,
    ));
    tokio::spawn(receive_pump(client, stream, broker, config));
    Ok(())
}

/// Read frames from the peer and relay each one to history and the bus.
pub async fn receive_pump<R, E>(
    client: Arc<Client>,
    mut stream: R,
    broker: Arc<dyn Broker>,
    config: HubConfig,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = client.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                relay(&client, broker.as_ref(), &config, text.as_str()).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => relay(&client, broker.as_ref(), &config, text).await,
                Err(_) => {
                    warn!(conn_id = %client.id, len = bytes.len(), "dropping non-utf8 binary frame");
                }
            },
            Some(Ok(Message::Pong(_))) => client.record_pong(),
            // Answered by the protocol layer.
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                client.close(CloseCause::ClientClosed).await;
                break;
            }
            Some(Err(e)) => {
                debug!(conn_id = %client.id, error = %e, "read failed");
                client.close(CloseCause::ReadFailed).await;
                break;
            }
        }
    }
}

async fn relay(client: &Client, broker: &dyn Broker, config: &HubConfig, payload: &str) {
    let envelope = Envelope::new(
        client.id.clone(),
        client.hub.id().clone(),
        client.username.clone(),
        payload,
    );
    let raw = match envelope.encode() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(conn_id = %client.id, error = %e, "dropping message");
            return;
        }
    };
    trace!(conn_id = %client.id, len = raw.len(), "relaying message");

    // History and publish are independent; a failed push still publishes.
    if let Err(e) = broker
        .push_history(&config.history_key, &raw, config.history_limit)
        .await
    {
        warn!(conn_id = %client.id, error = %e, "history push failed");
        client
            .metrics
            .counter_inc(names::HISTORY_PERSIST_ERRORS_TOTAL, &[], 1);
    }
    match broker.publish(&config.topic, &raw).await {
        Ok(()) => client.metrics.counter_inc(names::BUS_PUBLISHED_TOTAL, &[], 1),
        Err(e) => {
            warn!(conn_id = %client.id, error = %e, "publish failed, message not relayed");
            client
                .metrics
                .counter_inc(names::BUS_PUBLISH_ERRORS_TOTAL, &[], 1);
        }
    }
}

/// Drain the queue to the peer and keep the connection alive with pings.
pub async fn send_pump<S>(
    client: Arc<Client>,
    mut sink: S,
    mut queue: mpsc::Receiver<Frame>,
    ping_interval: Duration,
    write_wait: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pongs = client.last_pong.subscribe();
    let mut ping_sent = Instant::now();
    let mut pong_deadline: Option<Instant> = None;
    // Set once a write failed or was abandoned; the sink is not touched again.
    let mut sink_broken = false;

    loop {
        tokio::select! {
            biased;
            _ = client.cancel.cancelled() => break,
            Ok(()) = pongs.changed(), if pong_deadline.is_some() => {
                if *pongs.borrow_and_update() >= ping_sent {
                    pong_deadline = None;
                }
            }
            _ = time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                client.close(CloseCause::PingTimeout).await;
                break;
            }
            frame = queue.recv() => match frame {
                Some(frame) => {
                    let msg = Message::Text(Utf8Bytes::from(&*frame));
                    if let Err(e) = write(&mut sink, msg, write_wait, &client.cancel).await {
                        sink_broken = true;
                        debug!(conn_id = %client.id, error = %e, "write failed");
                        client.close(CloseCause::WriteFailed).await;
                        break;
                    }
                }
                None => {
                    client.close(CloseCause::Evicted).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = write(&mut sink, Message::Ping(Bytes::new()), write_wait, &client.cancel).await {
                    sink_broken = true;
                    debug!(conn_id = %client.id, error = %e, "ping failed");
                    client.close(CloseCause::WriteFailed).await;
                    break;
                }
                trace!(conn_id = %client.id, "sent ping");
                // A pong older than this ping does not answer it.
                ping_sent = Instant::now();
                pong_deadline = Some(ping_sent + write_wait);
            }
        }
    }

    if sink_broken {
        return;
    }
    // Close frame and close share one write_wait budget.
    let frame = client.cause().and_then(|cause| {
        cause.close_code().map(|code| CloseFrame {
            code,
            reason: Utf8Bytes::from_static(cause.reason()),
        })
    });
    let farewell = async {
        if let Some(frame) = frame {
            sink.send(Message::Close(Some(frame))).await?;
        }
        sink.close().await
    };
    let _ = time::timeout(write_wait, farewell).await;
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("{0}")]
    Sink(String),

    #[error("write timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connection cancelled mid-write")]
    Cancelled,
}

/// One frame write, bounded by `wait` and abandoned as soon as `cancel` fires.
async fn write<S>(
    sink: &mut S,
    msg: Message,
    wait: Duration,
    cancel: &CancellationToken,
) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WriteError::Cancelled),
        sent = time::timeout(wait, sink.send(msg)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
            Err(_) => Err(WriteError::TimedOut(wait)),
        },
    }
}
