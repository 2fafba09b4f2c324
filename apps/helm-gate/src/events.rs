use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Unsolicited agent notification delivered to internal subscribers.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub agent_id: String,
    pub name: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

struct SubscriberSlot {
    inbox: mpsc::Sender<AgentEvent>,
    dropped: Arc<AtomicU64>,
}

/// Fan-out of agent events to zero or more in-process subscribers.
///
/// Publishing never blocks: each subscriber has a bounded inbox and events
/// that do not fit are dropped and counted against that subscriber alone.
/// One slow or dead subscriber cannot stall frame processing or starve the
/// others.
pub struct EventBus {
    subscribers: DashMap<u64, SubscriberSlot>,
    next_id: AtomicU64,
    capacity: usize,
}

/// A live subscription; receive with [`Subscription::recv`], cancel with
/// [`EventBus::unsubscribe`].
pub struct Subscription {
    pub id: u64,
    inbox: mpsc::Receiver<AgentEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.inbox.try_recv().ok()
    }

    /// Events dropped for this subscriber because its inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.insert(
            id,
            SubscriberSlot {
                inbox: tx,
                dropped: dropped.clone(),
            },
        );
        debug!(subscriber = id, "event subscriber added");
        Subscription {
            id,
            inbox: rx,
            dropped,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "event subscriber removed");
        }
    }

    /// Non-blocking delivery to every current subscriber. Subscribers whose
    /// receiving half is gone are pruned here.
    pub fn publish(&self, event: AgentEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.inbox.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        subscriber = *entry.key(),
                        agent = %event.agent_id,
                        event = %event.name,
                        dropped_total = total,
                        "subscriber inbox full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
            debug!(subscriber = id, "pruned closed event subscriber");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
