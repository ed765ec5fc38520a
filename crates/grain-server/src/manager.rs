use std::sync::Arc;

use grain_broker::Broker;
use grain_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::HubConfig;
use crate::error::ServerError;
use crate::hub::{Hub, HubHandle};

/// Owns one hub and one bridge per shard and routes usernames to hubs.
#[derive(Clone)]
pub struct ConnectionManager {
    hubs: Vec<HubHandle>,
}

impl ConnectionManager {
    /// Subscribe, then spawn every hub and its bridge.
    ///
    /// All subscriptions are opened before any task starts, so a subscribe
    /// failure leaves nothing running.
    pub async fn start(
        config: &HubConfig,
        broker: Arc<dyn Broker>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<(Self, Vec<JoinHandle<()>>), ServerError> {
        let shards = config.shards.max(1);
        let mut subscriptions = Vec::with_capacity(shards);
        for _ in 0..shards {
            subscriptions.push(broker.subscribe(&config.topic).await?);
        }

        let mut hubs = Vec::with_capacity(shards);
        let mut tasks = Vec::with_capacity(shards * 2);
        for (shard, subscription) in subscriptions.into_iter().enumerate() {
            let (hub, handle) = Hub::new(shard, config.mailbox_capacity, Arc::clone(&metrics));
            tasks.push(tokio::spawn(hub.run()));
            tasks.push(Bridge::new(handle.clone(), Arc::clone(&metrics)).start(subscription));
            hubs.push(handle);
        }
        info!(shards, topic = %config.topic, "hubs started");
        Ok((Self { hubs }, tasks))
    }

    /// Hub owning `username`. Blank usernames are rejected.
    pub fn assign(&self, username: &str) -> Result<&HubHandle, ServerError> {
        if username.trim().is_empty() {
            return Err(ServerError::MissingUsername);
        }
        Ok(&self.hubs[shard_for(username, self.hubs.len())])
    }

    pub fn hubs(&self) -> &[HubHandle] {
        &self.hubs
    }

    /// Member count per shard, in shard order.
    pub async fn member_counts(&self) -> Result<Vec<usize>, ServerError> {
        let mut counts = Vec::with_capacity(self.hubs.len());
        for hub in &self.hubs {
            counts.push(hub.members().await?.len());
        }
        Ok(counts)
    }

    pub async fn total_members(&self) -> Result<usize, ServerError> {
        Ok(self.member_counts().await?.iter().sum())
    }
}

/// Stable username → shard mapping, the same in every process.
pub fn shard_for(username: &str, shards: usize) -> usize {
    fnv1a32(username.as_bytes()) as usize % shards.max(1)
}

const FNV1A32_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV1A32_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a. Fixed across builds and platforms, so every process
/// agrees on a user's shard.
fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV1A32_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV1A32_PRIME);
    }
    hash
}
