//! BitCraps consensus - Byzantine fault tolerant game state for peer-to-peer craps
//!
//! A fixed group of mutually distrustful participants agrees on one sequence of
//! game states. Module map:
//! - protocol: identifiers, tokens, dice, the craps rules state, the consensus
//!   engine and the bridge that puts it on the network
//! - crypto: Ed25519 identities and signatures
//! - transport: topic pub/sub the bridge runs on (in-memory or NATS)
//! - config / logging: node configuration and subscriber setup

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

// Re-export commonly used types for easy access
pub use config::Config;
pub use crypto::SigningKeyPair;
pub use error::{Error, Result};
pub use protocol::consensus::{
    ConsensusConfig, ConsensusEngine, GameConsensusState, GameOperation, GameProposal, GameSession,
};
pub use protocol::craps::{CrapsGame, GamePhase};
pub use protocol::network_consensus_bridge::{
    ConsensusEvent, NetworkConsensusBridge, NetworkConsensusBridgeConfig, NetworkConsensusBridgeStats,
};
pub use protocol::{BetType, CrapTokens, DiceRoll, GameId, PeerId, TREASURY_ADDRESS};
pub use transport::{ConsensusTransport, InMemoryTransport, TransportConfig};
