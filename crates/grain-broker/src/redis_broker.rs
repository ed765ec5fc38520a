use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::{Broker, BrokerError, Subscription};

/// Redis-backed broker.
///
/// Commands go through a shared [`ConnectionManager`] (reconnects on its own);
/// every subscription opens a dedicated pub/sub connection because a
/// subscribed Redis connection cannot issue other commands.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect and verify the server answers PING.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Connection(format!("open client: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Connection(format!("connect: {e}")))?;
        let broker = Self { client, conn };
        broker.ping().await?;
        info!(url, "connected to redis");
        Ok(broker)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("pubsub connection: {e}")))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BrokerError::Subscribe(format!("subscribe {topic}: {e}")))?;

        let topic = topic.to_string();
        // The on-message stream ends when the connection drops; there is no
        // error item, so undecodable payloads are skipped here.
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(Ok(payload)),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "skipping non-utf8 payload");
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(stream.boxed())
    }

    async fn push_history(&self, key: &str, entry: &str, limit: usize) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let stop = limit.max(1) as isize - 1;
        redis::pipe()
            .lpush(key, entry)
            .ignore()
            .ltrim(key, 0, stop)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn history(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("ping: {e}")))?;
        Ok(())
    }
}
