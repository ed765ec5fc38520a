use std::time::Duration;

/// Topic every process publishes to and every bridge subscribes to.
pub const DEFAULT_TOPIC: &str = "global_chat";
/// List holding the most recent envelopes.
pub const DEFAULT_HISTORY_KEY: &str = "chat_history";

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds a random port (tests).
    pub port: u16,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            hub: HubConfig::default(),
        }
    }
}

/// Sharding, queueing and keepalive settings shared by every hub.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub shards: usize,
    pub mailbox_capacity: usize,
    /// Per-client outbound queue; a full queue evicts the client.
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    /// Bound on every socket write and on the wait for a pong.
    pub write_wait: Duration,
    pub history_limit: usize,
    pub topic: String,
    pub history_key: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            mailbox_capacity: 256,
            queue_capacity: 1024,
            ping_interval: Duration::from_secs(15),
            write_wait: Duration::from_secs(5),
            history_limit: 100,
            topic: DEFAULT_TOPIC.into(),
            history_key: DEFAULT_HISTORY_KEY.into(),
        }
    }
}

/// One shard per available processing unit.
pub fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.hub.shards >= 1);
        assert_eq!(config.hub.queue_capacity, 1024);
        assert_eq!(config.hub.ping_interval, Duration::from_secs(15));
        assert_eq!(config.hub.write_wait, Duration::from_secs(5));
        assert_eq!(config.hub.history_limit, 100);
        assert_eq!(config.hub.topic, "global_chat");
        assert_eq!(config.hub.history_key, "chat_history");
    }
}
