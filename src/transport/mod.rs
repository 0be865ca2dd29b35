//! Transport layer for consensus traffic
//!
//! The bridge only needs topic broadcast and subscription, captured by the
//! `ConsensusTransport` trait. Variants:
//! - `InMemoryTransport`: in-process hub, used by tests and the simulator
//! - `NatsTransport`: external broker, behind the `broker-nats` feature

pub mod memory;
#[cfg(feature = "broker-nats")]
pub mod nats;
pub mod traits;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};

pub use memory::InMemoryTransport;
#[cfg(feature = "broker-nats")]
pub use nats::NatsTransport;
pub use traits::ConsensusTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    InMemory,
    Nats,
}

/// Transport selection, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub nats_url: String,
    /// Per-topic buffer; slow subscribers past this lag and lose messages
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::InMemory,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            channel_capacity: 1024,
        }
    }
}

/// Build the configured transport
pub async fn connect(config: &TransportConfig) -> Result<Arc<dyn ConsensusTransport>> {
    match config.kind {
        TransportKind::InMemory => Ok(Arc::new(InMemoryTransport::new(config.channel_capacity))),
        #[cfg(feature = "broker-nats")]
        TransportKind::Nats => Ok(Arc::new(
            NatsTransport::connect(&config.nats_url, config.channel_capacity).await?,
        )),
        #[cfg(not(feature = "broker-nats"))]
        TransportKind::Nats => Err(Error::Config(
            "NATS transport requires the broker-nats feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_transport_is_in_memory() {
        let transport = connect(&TransportConfig::default()).await.unwrap();
        assert_eq!(transport.name(), "in-memory");
    }

    #[cfg(not(feature = "broker-nats"))]
    #[tokio::test]
    async fn test_nats_requires_feature() {
        let config = TransportConfig {
            kind: TransportKind::Nats,
            ..TransportConfig::default()
        };
        assert!(matches!(connect(&config).await, Err(Error::Config(_))));
    }
}
