//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;

/// Topic-based pub/sub capability the consensus bridge runs on.
///
/// Delivery is best effort and unordered across topics. A subscriber also
/// receives its own broadcasts.
#[async_trait]
pub trait ConsensusTransport: Send + Sync {
    /// Publish an encoded message to every subscriber of `topic`
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Receive everything published to `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>>;

    fn name(&self) -> &'static str;
}
