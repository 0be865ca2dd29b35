//! P2P consensus messages
//!
//! Every consensus payload travels inside a signed `ConsensusMessage`
//! envelope. The message id commits to the payload, so the sender's signature
//! over the id covers the whole message and doubles as the de-duplication key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_parts, verify_signature, SigningKeyPair};
use crate::error::{Error, Result};
use crate::protocol::consensus::commit_reveal::{RandomnessCommit, RandomnessReveal};
use crate::protocol::consensus::engine::{FinalityCertificate, GameConsensusState, GameProposal};
use crate::protocol::consensus::validation::{Dispute, DisputeVote};
use crate::protocol::consensus::voting::SignedVote;
use crate::protocol::{current_timestamp, short_hex, GameId, Hash256, PeerId, Signature};

/// Network-level consensus message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// Message ID for deduplication
    pub message_id: Hash256,
    pub sender: PeerId,
    pub game_id: GameId,
    pub timestamp: u64,
    pub payload: ConsensusPayload,
    pub signature: Signature,
}

/// Core consensus message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    Proposal(GameProposal),
    Vote(SignedVote),

    /// Finality certificate, sent by the proposer once its proposal finalizes
    Finalized(FinalityCertificate),

    /// Snapshot of the finalized state plus the certificate that produced it
    StateSync {
        state_hash: Hash256,
        sequence_number: u64,
        state: CompressedGameState,
        certificate: FinalityCertificate,
    },

    // Randomness generation (commit-reveal)
    RandomnessCommit(RandomnessCommit),
    RandomnessReveal(RandomnessReveal),

    // Dispute resolution
    DisputeClaim(Dispute),
    DisputeVote(DisputeVote),
}

impl ConsensusPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusPayload::Proposal(_) => "proposal",
            ConsensusPayload::Vote(_) => "vote",
            ConsensusPayload::Finalized(_) => "finalized",
            ConsensusPayload::StateSync { .. } => "state_sync",
            ConsensusPayload::RandomnessCommit(_) => "randomness_commit",
            ConsensusPayload::RandomnessReveal(_) => "randomness_reveal",
            ConsensusPayload::DisputeClaim(_) => "dispute_claim",
            ConsensusPayload::DisputeVote(_) => "dispute_vote",
        }
    }
}

/// LZ4-compressed game state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedGameState {
    pub sequence: u64,
    /// LZ4 block with the uncompressed size prepended
    pub data: Vec<u8>,
    /// CRC32 of the uncompressed bytes
    pub checksum: u32,
    pub original_size: u32,
}

impl CompressedGameState {
    pub fn compress(state: &GameConsensusState) -> Result<Self> {
        let serialized = bincode::serialize(state)?;
        let original_size = u32::try_from(serialized.len())
            .map_err(|_| Error::ResourceExhausted("state snapshot too large".to_string()))?;
        Ok(Self {
            sequence: state.sequence_number,
            data: lz4_flex::compress_prepend_size(&serialized),
            checksum: crc32fast::hash(&serialized),
            original_size,
        })
    }

    pub fn decompress(&self) -> Result<GameConsensusState> {
        let decompressed = lz4_flex::decompress_size_prepended(&self.data)
            .map_err(|e| Error::Serialization(format!("Decompression failed: {}", e)))?;

        if decompressed.len() != self.original_size as usize || crc32fast::hash(&decompressed) != self.checksum {
            return Err(Error::StateChecksumMismatch(format!(
                "snapshot for sequence {} failed its checksum",
                self.sequence
            )));
        }

        let state: GameConsensusState = bincode::deserialize(&decompressed)?;
        if state.sequence_number != self.sequence {
            return Err(Error::StateChecksumMismatch(format!(
                "snapshot labelled {} holds sequence {}",
                self.sequence, state.sequence_number
            )));
        }
        Ok(state)
    }
}

impl ConsensusMessage {
    /// Create and sign a message stamped with the current time
    pub fn new(keys: &SigningKeyPair, game_id: GameId, payload: ConsensusPayload) -> Result<Self> {
        Self::new_at(keys, game_id, payload, current_timestamp())
    }

    pub fn new_at(keys: &SigningKeyPair, game_id: GameId, payload: ConsensusPayload, timestamp: u64) -> Result<Self> {
        let sender = keys.peer_id();
        let message_id = Self::generate_message_id(&sender, &game_id, timestamp, &payload)?;
        Ok(Self {
            message_id,
            sender,
            game_id,
            timestamp,
            payload,
            signature: keys.sign(&message_id),
        })
    }

    /// Deterministic message ID over the full content
    fn generate_message_id(
        sender: &PeerId,
        game_id: &GameId,
        timestamp: u64,
        payload: &ConsensusPayload,
    ) -> Result<Hash256> {
        let payload_bytes = bincode::serialize(payload)?;
        Ok(hash_parts(
            b"BITCRAPS_MESSAGE",
            &[sender, game_id, &timestamp.to_le_bytes(), &payload_bytes],
        ))
    }

    /// Check the id against the content and the sender's signature over it
    pub fn verify(&self) -> Result<()> {
        let expected = Self::generate_message_id(&self.sender, &self.game_id, self.timestamp, &self.payload)?;
        if expected != self.message_id {
            return Err(Error::Protocol(format!(
                "message {} id does not match its content",
                short_hex(&self.message_id)
            )));
        }
        if !verify_signature(&self.sender, &self.message_id, &self.signature) {
            return Err(Error::InvalidSignature(format!(
                "message {} from {}",
                short_hex(&self.message_id),
                short_hex(&self.sender)
            )));
        }
        Ok(())
    }

    /// Check if message is recent (for spam prevention)
    pub fn is_recent(&self, max_age_seconds: u64, now: u64) -> bool {
        self.timestamp + max_age_seconds >= now
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
