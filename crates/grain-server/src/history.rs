use grain_broker::Broker;
use grain_core::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hub::Frame;

/// Queue up to `limit` stored envelopes, oldest first, for a new client.
///
/// Runs before the client is registered, so nothing else writes to the queue
/// yet. Returns how many entries were queued.
pub async fn replay(
    broker: &dyn Broker,
    key: &str,
    limit: usize,
    queue: &mpsc::Sender<Frame>,
) -> usize {
    let entries = match broker.history(key).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(key, error = %e, "history fetch failed, skipping replay");
            return 0;
        }
    };

    let mut replayed = 0;
    for raw in entries.into_iter().take(limit).rev() {
        if let Err(e) = Envelope::decode(&raw) {
            debug!(key, error = %e, "skipping malformed history entry");
            continue;
        }
        if queue.try_send(Frame::from(raw)).is_err() {
            warn!(key, replayed, "client queue full, replay cut short");
            break;
        }
        replayed += 1;
    }
    replayed
}
