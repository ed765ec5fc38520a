//! Shard actor. A hub owns its membership map outright: the map is only read
//! or written inside [`Hub::run`], one mailbox event at a time, so register,
//! unregister and broadcast can never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use grain_core::{ConnectionId, Envelope, EnvelopeError, HubId};
use grain_telemetry::{names, MetricsRecorder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::ServerError;

/// A serialized envelope as queued to members. Shared, never copied per member.
pub type Frame = Arc<str>;

/// A new member: its id, username and the sending half of its outbound queue.
///
/// The hub keeps the only sender, so dropping the membership entry is what
/// closes the queue.
pub struct Registration {
    pub id: ConnectionId,
    pub username: String,
    pub queue: mpsc::Sender<Frame>,
}

/// One envelope to deliver to every member except its producer.
#[derive(Clone, Debug)]
pub struct Broadcast {
    pub origin: ConnectionId,
    pub frame: Frame,
}

impl Broadcast {
    /// Decode a bus payload. Malformed payloads never reach a hub.
    pub fn from_wire(raw: String) -> Result<Self, EnvelopeError> {
        let envelope = Envelope::decode(&raw)?;
        Ok(Self {
            origin: envelope.id,
            frame: Arc::from(raw),
        })
    }
}

pub enum HubEvent {
    Register(Registration),
    Unregister(ConnectionId),
    Broadcast(Broadcast),
    /// Read-only snapshot of member ids.
    Members(oneshot::Sender<Vec<ConnectionId>>),
}

struct Member {
    username: String,
    queue: mpsc::Sender<Frame>,
}

pub struct Hub {
    id: HubId,
    shard: usize,
    shard_label: String,
    members: HashMap<ConnectionId, Member>,
    mailbox: mpsc::Receiver<HubEvent>,
    metrics: Arc<MetricsRecorder>,
}

impl Hub {
    /// Build a hub and the handle used to reach its mailbox.
    pub fn new(
        shard: usize,
        mailbox_capacity: usize,
        metrics: Arc<MetricsRecorder>,
    ) -> (Self, HubHandle) {
        let id = HubId::new();
        let (tx, rx) = mpsc::channel(mailbox_capacity);
        let hub = Self {
            id: id.clone(),
            shard,
            shard_label: shard.to_string(),
            members: HashMap::new(),
            mailbox: rx,
            metrics,
        };
        let handle = HubHandle { id, shard, tx };
        (hub, handle)
    }

    /// Process the mailbox until every handle is dropped.
    pub async fn run(mut self) {
        debug!(hub_id = %self.id, shard = self.shard, "hub running");
        while let Some(event) = self.mailbox.recv().await {
            self.handle(event);
        }
        debug!(hub_id = %self.id, shard = self.shard, "hub mailbox closed");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(registration) => self.register(registration),
            HubEvent::Unregister(id) => {
                if self.remove(&id) {
                    debug!(hub_id = %self.id, conn_id = %id, "member unregistered");
                }
            }
            HubEvent::Broadcast(broadcast) => self.broadcast(broadcast),
            HubEvent::Members(reply) => {
                let _ = reply.send(self.members.keys().cloned().collect());
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            username,
            queue,
        } = registration;
        debug!(hub_id = %self.id, conn_id = %id, username = %username, "member registered");
        let member = Member { username, queue };
        // A repeated id replaces the old entry; its queue sender is dropped.
        if self.members.insert(id, member).is_none() {
            self.metrics.counter_inc(
                names::WS_CONNECTIONS_TOTAL,
                &[("shard", self.shard_label.as_str())],
                1,
            );
            self.metrics.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], 1);
        }
    }

    /// Drop a member and with it the only sender of its queue.
    fn remove(&mut self, id: &ConnectionId) -> bool {
        if self.members.remove(id).is_some() {
            self.metrics.gauge_inc(names::WS_CONNECTIONS_ACTIVE, &[], -1);
            true
        } else {
            false
        }
    }

    fn broadcast(&mut self, broadcast: Broadcast) {
        let shard = self.shard_label.clone();
        let labels = [("shard", shard.as_str())];
        self.metrics.counter_inc(names::HUB_BROADCASTS_TOTAL, &labels, 1);

        let mut delivered = 0u64;
        let mut evicted = Vec::new();
        for (id, member) in &self.members {
            if *id == broadcast.origin {
                continue;
            }
            match member.queue.try_send(Arc::clone(&broadcast.frame)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        hub_id = %self.id,
                        conn_id = %id,
                        username = %member.username,
                        "outbound queue full, evicting slow client"
                    );
                    evicted.push((id.clone(), true));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Send pump already gone; its teardown will unregister too.
                    evicted.push((id.clone(), false));
                }
            }
        }

        for (id, slow) in evicted {
            if self.remove(&id) && slow {
                self.metrics.counter_inc(names::HUB_EVICTIONS_TOTAL, &labels, 1);
            }
        }
        self.metrics
            .counter_inc(names::HUB_DELIVERIES_TOTAL, &labels, delivered);
        trace!(
            hub_id = %self.id,
            origin = %broadcast.origin,
            delivered,
            "broadcast delivered"
        );
    }
}

/// Cloneable mailbox address of one hub.
#[derive(Clone)]
pub struct HubHandle {
    id: HubId,
    shard: usize,
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    pub fn id(&self) -> &HubId {
        &self.id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub async fn register(&self, registration: Registration) -> Result<(), ServerError> {
        self.send(HubEvent::Register(registration)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.send(HubEvent::Unregister(id)).await
    }

    pub async fn broadcast(&self, broadcast: Broadcast) -> Result<(), ServerError> {
        self.send(HubEvent::Broadcast(broadcast)).await
    }

    /// Member ids as seen after every event queued before this call.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Members(reply)).await?;
        rx.await.map_err(|_| ServerError::HubClosed(self.shard))
    }

    async fn send(&self, event: HubEvent) -> Result<(), ServerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ServerError::HubClosed(self.shard))
    }

    /// Handle whose mailbox is read directly by the test.
    #[cfg(test)]
    pub(crate) fn detached(shard: usize) -> (Self, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = Self {
            id: HubId::new(),
            shard,
            tx,
        };
        (handle, rx)
    }
}
