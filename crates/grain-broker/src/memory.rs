use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::{Broker, BrokerError, Subscription};

const TOPIC_CAPACITY: usize = 4096;

/// In-process broker with the same semantics as the Redis one.
///
/// Topics are tokio broadcast channels, lists are deques kept most recent
/// first. Servers sharing one instance behave like processes sharing a Redis.
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<String>>,
    lists: DashMap<String, VecDeque<String>>,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            lists: DashMap::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Number of successful `publish` calls so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.topic(topic).send(payload.to_string());
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let rx = self.topic(topic).subscribe();
        let topic = topic.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let item = match item {
                Ok(payload) => Some(Ok(payload)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(topic = %topic, skipped, "subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(item)
        });
        Ok(stream.boxed())
    }

    async fn push_history(&self, key: &str, entry: &str, limit: usize) -> Result<(), BrokerError> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(entry.to_string());
        list.truncate(limit.max(1));
        Ok(())
    }

    async fn history(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("chat").await.unwrap();
        let mut b = broker.subscribe("chat").await.unwrap();

        broker.publish("chat", "hello").await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap(), "hello");
        assert_eq!(b.next().await.unwrap().unwrap(), "hello");
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut other = broker.subscribe("other").await.unwrap();

        broker.publish("chat", "hello").await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(50), other.next()).await;
        assert!(got.is_err(), "subscriber on another topic must not receive");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("nobody", "x").await.is_ok());
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_trimmed() {
        let broker = MemoryBroker::new();
        for i in 0..150 {
            broker.push_history("h", &format!("m{i}"), 100).await.unwrap();
        }
        let entries = broker.history("h").await.unwrap();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0], "m149");
        assert_eq!(entries[99], "m50");
    }

    #[tokio::test]
    async fn missing_history_is_empty() {
        let broker = MemoryBroker::new();
        assert!(broker.history("nothing").await.unwrap().is_empty());
    }
}
