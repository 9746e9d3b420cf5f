//! Realtime Bus (spec §4.5, C5).
//!
//! A process-local pub/sub keyed by vault. Per-subscriber delivery
//! uses a bounded `tokio::sync::mpsc` channel with a non-blocking
//! `try_send`: a subscriber whose buffer is full is dropped rather
//! than backpressuring the publisher (spec §4.5/§5/§9 — "drop-on-full
//! is the design, not a bug"). The registry itself is a
//! `parking_lot::RwLock`-guarded map, the concurrency primitive the
//! tvix/castore and nearcore example packs reach for around exactly
//! this kind of short-held shared map, since the teacher repo has no
//! in-process broker of its own for a closer match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::REALTIME_CHANNEL_CAPACITY;
use crate::ids::VaultId;
use crate::store::metadata::Op;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "backlog")]
    Backlog { events: Vec<EventData> },
    #[serde(rename = "event")]
    Event {
        #[serde(rename = "vaultId")]
        vault_id: String,
        seq: i64,
        #[serde(rename = "opType")]
        op_type: &'static str,
        payload: Value,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    #[serde(rename = "keepalive")]
    Keepalive { ts: i64 },
    #[serde(rename = "error")]
    Error {
        code: &'static str,
        message: String,
        remediation: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventData {
    pub seq: i64,
    #[serde(rename = "opType")]
    pub op_type: &'static str,
    pub payload: Value,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl From<&Op> for EventData {
    fn from(op: &Op) -> Self {
        EventData {
            seq: op.seq,
            op_type: op.op_type.as_str(),
            payload: op.payload.clone(),
            created_at: op.created_at,
        }
    }
}

/// A committed op, ready to publish (spec §4.3 step 3a, §4.5 publish
/// contract: published only after the append transaction commits).
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub vault_id: VaultId,
    pub seq: i64,
    pub op_type: &'static str,
    pub payload: Value,
    pub created_at: i64,
}

impl From<&Op> for BusEvent {
    fn from(op: &Op) -> Self {
        BusEvent {
            vault_id: op.vault_id.clone(),
            seq: op.seq,
            op_type: op.op_type.as_str(),
            payload: op.payload.clone(),
            created_at: op.created_at,
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
}

/// Handle to a live subscription. Deregisters itself from the bus on
/// drop, so an aborted/cancelled task still releases its slot (spec
/// §5 cancellation: "remove subscription registrations").
pub struct Subscription {
    bus: Bus,
    vault_id: VaultId,
    id: u64,
    pub receiver: mpsc::Receiver<BusEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(&self.vault_id, self.id);
    }
}

#[derive(Clone)]
pub struct Bus {
    topics: Arc<RwLock<HashMap<VaultId, Topic>>>,
    next_id: Arc<AtomicU64>,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a new subscriber for `vault_id`. Callers that also take a
    /// backlog snapshot from the Metadata Store should subscribe first and
    /// read the snapshot second, then drop any received event whose `seq`
    /// falls inside the snapshot: events can arrive on both paths during
    /// the gap, never on neither.
    pub fn subscribe(&self, vault_id: VaultId) -> Subscription {
        let (tx, rx) = mpsc::channel(REALTIME_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.write();
        topics
            .entry(vault_id.clone())
            .or_insert_with(Topic::default)
            .subscribers
            .push(Subscriber { id, sender: tx });

        Subscription {
            bus: self.clone(),
            vault_id,
            id,
            receiver: rx,
        }
    }

    fn unregister(&self, vault_id: &VaultId, id: u64) {
        let mut topics = self.topics.write();
        if let Some(topic) = topics.get_mut(vault_id) {
            topic.subscribers.retain(|s| s.id != id);
            if topic.subscribers.is_empty() {
                topics.remove(vault_id);
            }
        }
    }

    /// `Publish` (spec §4.5): best-effort, at-most-once per
    /// subscription; a full buffer drops that subscriber instead of
    /// blocking.
    pub fn publish(&self, event: BusEvent) {
        let mut topics = self.topics.write();
        let Some(topic) = topics.get_mut(&event.vault_id) else {
            return;
        };

        topic.subscribers.retain(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if topic.subscribers.is_empty() {
            topics.remove(&event.vault_id);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vid() -> VaultId {
        "11111111-1111-4111-8111-111111111111".parse().unwrap()
    }

    fn event(seq: i64) -> BusEvent {
        BusEvent {
            vault_id: vid(),
            seq,
            op_type: "md_update",
            payload: Value::Null,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(vid());
        bus.publish(event(1));
        bus.publish(event(2));

        assert_eq!(sub.receiver.recv().await.unwrap().seq, 1);
        assert_eq!(sub.receiver.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn full_buffer_drops_subscriber_without_blocking() {
        let bus = Bus::new();
        let sub = bus.subscribe(vid());
        for i in 0..(REALTIME_CHANNEL_CAPACITY as i64 + 10) {
            bus.publish(event(i));
        }
        // publisher never blocked; subscriber is gone from the registry
        assert_eq!(bus.topics.read().len(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn drop_deregisters_subscription() {
        let bus = Bus::new();
        let sub = bus.subscribe(vid());
        assert_eq!(bus.topics.read().get(&vid()).unwrap().subscribers.len(), 1);
        drop(sub);
        assert!(bus.topics.read().get(&vid()).is_none());
    }

    #[tokio::test]
    async fn unrelated_vault_does_not_receive_events() {
        let bus = Bus::new();
        let other: VaultId = "33333333-3333-4333-8333-333333333333".parse().unwrap();
        let mut sub = bus.subscribe(other);
        bus.publish(event(1));
        // no event should arrive; try_recv should find the channel empty
        assert!(sub.receiver.try_recv().is_err());
    }
}
