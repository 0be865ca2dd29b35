use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Result;

use super::ConsensusTransport;

/// In-process pub/sub hub on per-topic broadcast channels.
///
/// Every bridge sharing one hub sees every message, which is how tests and
/// the simulator wire several peers together.
pub struct InMemoryTransport {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl InMemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ConsensusTransport for InMemoryTransport {
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()> {
        // No subscribers is not an error for pub/sub
        if self.sender(topic).send(payload).is_err() {
            log::trace!("Dropped message on {}: no subscribers", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>> {
        Ok(self.sender(topic).subscribe())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
