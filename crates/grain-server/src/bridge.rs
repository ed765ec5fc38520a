use std::sync::Arc;

use futures::StreamExt;
use grain_broker::Subscription;
use grain_telemetry::{names, MetricsRecorder};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::hub::{Broadcast, HubHandle};

/// Forwards every bus message on the chat topic into one hub's mailbox.
pub struct Bridge {
    hub: HubHandle,
    metrics: Arc<MetricsRecorder>,
}

impl Bridge {
    pub fn new(hub: HubHandle, metrics: Arc<MetricsRecorder>) -> Self {
        Self { hub, metrics }
    }

    /// Spawn the forwarding task over an already-open subscription.
    pub fn start(self, subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription))
    }

    /// Runs until the subscription fails or ends, or the hub stops.
    pub async fn run(self, mut subscription: Subscription) {
        let shard = self.hub.shard();
        let label = shard.to_string();
        let labels = [("shard", label.as_str())];

        loop {
            let raw = match subscription.next().await {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    error!(shard, hub_id = %self.hub.id(), error = %e, "bus receive failed, bridge stopped");
                    return;
                }
                None => {
                    error!(shard, hub_id = %self.hub.id(), "bus subscription ended, bridge stopped");
                    return;
                }
            };

            let broadcast = match Broadcast::from_wire(raw) {
                Ok(broadcast) => broadcast,
                Err(e) => {
                    warn!(shard, error = %e, "discarding undecodable bus message");
                    self.metrics
                        .counter_inc(names::BRIDGE_DECODE_ERRORS_TOTAL, &labels, 1);
                    continue;
                }
            };
            self.metrics
                .counter_inc(names::BRIDGE_MESSAGES_TOTAL, &labels, 1);

            if self.hub.broadcast(broadcast).await.is_err() {
                debug!(shard, "hub stopped, bridge exiting");
                return;
            }
        }
    }
}
