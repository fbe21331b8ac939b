//! Push notifications for tracker subscribers
//!
//! Provides a broadcast channel for pushing chain and transaction events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{BlockHash, Txid};

/// Events broadcast to subscribers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum TrackerNotification {
    /// The chain tip moved
    NewBlock { hash: BlockHash, height: u32 },
    /// A transaction touching a scheme was recorded
    NewTransaction {
        scheme: String,
        txid: Txid,
        confirmed: bool,
    },
}

/// Broadcaster for tracker events
#[derive(Debug)]
pub struct Notifier {
    sender: broadcast::Sender<TrackerNotification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Broadcast an event to all subscribers
    pub fn broadcast(&self, event: TrackerNotification) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
