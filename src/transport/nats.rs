//! NATS-backed consensus transport

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

use super::ConsensusTransport;

/// Pub/sub over a NATS server. Each topic maps to one NATS subject; a
/// forwarding task fans the subscription out to local receivers.
pub struct NatsTransport {
    client: async_nats::Client,
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl NatsTransport {
    pub async fn connect(url: &str, capacity: usize) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Transport(format!("NATS connect to {} failed: {}", url, e)))?;
        log::info!("Connected to NATS at {}", url);
        Ok(Self {
            client,
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        })
    }
}

#[async_trait]
impl ConsensusTransport for NatsTransport {
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| Error::Transport(format!("NATS publish failed: {}", e)))
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>> {
        if let Some(sender) = self.topics.get(topic) {
            return Ok(sender.subscribe());
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        let mut subscription = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| Error::Transport(format!("NATS subscribe to {} failed: {}", topic, e)))?;
        self.topics.insert(topic.to_string(), sender.clone());

        let topics = self.topics.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                // Keeps forwarding while any receiver is alive
                if sender.send(message.payload).is_err() && sender.receiver_count() == 0 {
                    break;
                }
            }
            topics.remove(&topic);
            log::debug!("NATS subscription for {} closed", topic);
        });

        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}
