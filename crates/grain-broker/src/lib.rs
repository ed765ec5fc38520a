//! External bus used to relay envelopes between server processes and to keep
//! the bounded chat history.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `redis_broker` | Production broker: Redis PUBLISH/SUBSCRIBE plus LPUSH/LTRIM/LRANGE |
//! | `memory` | In-process broker for single-node runs and tests |
//!
//! The server only ever talks to the [`Broker`] trait, so several servers can
//! share one `Arc<MemoryBroker>` in tests and behave like separate processes
//! on one Redis.

pub mod error;
pub mod memory;
pub mod redis_broker;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of raw payloads published to one topic.
pub type Subscription = BoxStream<'static, Result<String, BrokerError>>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload to every subscriber of `topic`, in every process.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    /// Open a subscription to `topic`. The subscription is live once this
    /// returns; later publishes are delivered to it.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    /// Push `entry` to the front of the list at `key` and trim the list to
    /// its `limit` most recent entries.
    async fn push_history(&self, key: &str, entry: &str, limit: usize) -> Result<(), BrokerError>;

    /// Whole list at `key`, most recent first.
    async fn history(&self, key: &str) -> Result<Vec<String>, BrokerError>;

    /// Round-trip check used at startup.
    async fn ping(&self) -> Result<(), BrokerError>;
}
