use std::{collections::HashMap, sync::Mutex};

use shared::{domain::BatchId, protocol::StreamEvent};
use tokio::sync::broadcast;

pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Topic-per-batch broadcast. Events published while a batch has no
/// subscribers are dropped, not buffered; a late joiner only sees events
/// published after its `subscribe` returned.
pub struct ResultBroker {
    capacity: usize,
    topics: Mutex<HashMap<BatchId, broadcast::Sender<StreamEvent>>>,
}

impl Default for ResultBroker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl ResultBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a subscriber, creating the topic on demand. Subscribing
    /// to a batch nobody has submitted is legal: results may be racing the
    /// join, and a dormant topic costs one map entry.
    ///
    /// A receiver obtained before `publish` returns is guaranteed to
    /// observe that publish.
    pub fn subscribe(&self, batch_id: &BatchId) -> broadcast::Receiver<StreamEvent> {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        topics
            .entry(batch_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Fans `event` out to every current subscriber of `batch_id` and
    /// returns how many there were. The sender is cloned out of the map
    /// lock so unrelated batches do not contend on the send.
    pub fn publish(&self, batch_id: &BatchId, event: StreamEvent) -> usize {
        let sender = {
            let topics = self.topics.lock().expect("broker lock poisoned");
            topics.get(batch_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drops the topic once its last receiver is gone. Idempotent; called
    /// after unsubscribes and during retention sweeps.
    pub fn prune(&self, batch_id: &BatchId) {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        if let Some(sender) = topics.get(batch_id) {
            if sender.receiver_count() == 0 {
                topics.remove(batch_id);
            }
        }
    }

    pub fn subscriber_count(&self, batch_id: &BatchId) -> usize {
        let topics = self.topics.lock().expect("broker lock poisoned");
        topics
            .get(batch_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("broker lock poisoned").len()
    }
}
