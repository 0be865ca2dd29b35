//! Validation logic and dispute resolution
//!
//! A dispute never edits state. When participants uphold it, the disputer
//! submits the matching compensating operation through the normal
//! proposal/vote path.

use lru::LruCache;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::crypto::{hash_parts, verify_signature, SigningKeyPair};
use crate::error::{Error, Result};
use crate::protocol::{short_hex, Bet, CrapTokens, DiceRoll, PeerId, Signature, TREASURY_ADDRESS};

use super::engine::GameOperation;
use super::{byzantine_threshold, DisputeId, RoundId, StateHash};

pub const DISPUTE_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Dispute handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeConfig {
    #[serde(with = "humantime_serde")]
    pub resolution_timeout: Duration,
    pub max_active_disputes: usize,
    pub max_evidence_items: usize,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            resolution_timeout: DISPUTE_RESOLUTION_TIMEOUT,
            max_active_disputes: 16,
            max_evidence_items: 32,
        }
    }
}

/// Dispute representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub disputer: PeerId,
    pub disputed_state: StateHash,
    pub claim: DisputeClaim,
    pub evidence: Vec<DisputeEvidence>,
    pub created_at: u64,
    pub resolution_deadline: u64,
    pub signature: Signature,
}

/// Types of disputes that can be raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisputeClaim {
    InvalidBet {
        player: PeerId,
        bet: Bet,
        reason: String,
    },
    InvalidRoll {
        round_id: RoundId,
        claimed_roll: DiceRoll,
        reason: String,
    },
    InvalidPayout {
        player: PeerId,
        expected: CrapTokens,
        actual: CrapTokens,
    },
    DoubleSpending {
        player: PeerId,
        conflicting_bets: Vec<Bet>,
    },
    ConsensusViolation {
        violated_rule: String,
        details: String,
    },
}

/// Evidence for dispute resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisputeEvidence {
    SignedTransaction {
        data: Vec<u8>,
        signature: Signature,
    },
    StateProof {
        state_hash: StateHash,
        proof: Vec<u8>,
    },
    TimestampProof {
        timestamp: u64,
        proof: Vec<u8>,
    },
    WitnessTestimony {
        witness: PeerId,
        testimony: String,
        signature: Signature,
    },
}

/// Types of dispute votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeVoteType {
    /// The claim holds and must be compensated
    Uphold,
    /// The claim is unfounded
    Reject,
}

/// Dispute resolution vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeVote {
    pub voter: PeerId,
    pub dispute_id: DisputeId,
    pub vote: DisputeVoteType,
    pub reasoning: String,
    pub timestamp: u64,
    pub signature: Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeOutcome {
    Upheld,
    Rejected,
}

/// Final word on a dispute
#[derive(Debug, Clone, PartialEq)]
pub struct DisputeResolution {
    pub dispute_id: DisputeId,
    pub disputer: PeerId,
    pub outcome: DisputeOutcome,
    /// Operation the disputer submits when the claim is upheld
    pub compensation: Option<GameOperation>,
    /// True when the deadline passed without a decision
    pub expired: bool,
}

impl Dispute {
    pub fn new(
        keys: &SigningKeyPair,
        disputed_state: StateHash,
        claim: DisputeClaim,
        evidence: Vec<DisputeEvidence>,
        created_at: u64,
        resolution_timeout: Duration,
    ) -> Result<Self> {
        let disputer = keys.peer_id();
        let id = Self::generate_dispute_id(&disputer, &disputed_state, &claim, created_at)?;
        Ok(Self {
            id,
            disputer,
            disputed_state,
            claim,
            evidence,
            created_at,
            resolution_deadline: created_at + resolution_timeout.as_secs(),
            signature: keys.sign(&id),
        })
    }

    fn generate_dispute_id(
        disputer: &PeerId,
        disputed_state: &StateHash,
        claim: &DisputeClaim,
        created_at: u64,
    ) -> Result<DisputeId> {
        let claim_bytes = bincode::serialize(claim)?;
        Ok(hash_parts(
            b"BITCRAPS_DISPUTE",
            &[disputer, disputed_state, &claim_bytes, &created_at.to_le_bytes()],
        ))
    }

    /// Check that the id matches the content and the disputer signed it
    pub fn verify(&self) -> Result<bool> {
        let id = Self::generate_dispute_id(&self.disputer, &self.disputed_state, &self.claim, self.created_at)?;
        Ok(id == self.id && verify_signature(&self.disputer, &self.id, &self.signature))
    }

    /// The operation that undoes the harm described by the claim, if any
    pub fn compensating_operation(&self) -> Option<GameOperation> {
        match &self.claim {
            DisputeClaim::InvalidBet { player, bet, .. } => Some(GameOperation::CancelBet {
                player: *player,
                bet_type: bet.bet_type,
            }),
            DisputeClaim::InvalidPayout {
                player,
                expected,
                actual,
            } => {
                let delta = i128::from(expected.amount()) - i128::from(actual.amount());
                let delta = i64::try_from(delta).ok().filter(|d| *d != 0)?;
                let mut changes = std::collections::BTreeMap::new();
                changes.insert(*player, delta);
                changes.insert(TREASURY_ADDRESS, delta.checked_neg()?);
                Some(GameOperation::UpdateBalances {
                    changes,
                    reason: format!("payout correction for dispute {}", short_hex(&self.id)),
                })
            }
            DisputeClaim::InvalidRoll { .. }
            | DisputeClaim::DoubleSpending { .. }
            | DisputeClaim::ConsensusViolation { .. } => None,
        }
    }
}

impl DisputeVote {
    pub fn new(
        keys: &SigningKeyPair,
        dispute_id: DisputeId,
        vote: DisputeVoteType,
        reasoning: String,
        timestamp: u64,
    ) -> Self {
        let voter = keys.peer_id();
        Self {
            voter,
            dispute_id,
            vote,
            reasoning,
            timestamp,
            signature: keys.sign(&Self::signing_payload(&dispute_id, &voter, vote)),
        }
    }

    fn signing_payload(dispute_id: &DisputeId, voter: &PeerId, vote: DisputeVoteType) -> [u8; 32] {
        let tag = match vote {
            DisputeVoteType::Uphold => 1u8,
            DisputeVoteType::Reject => 2u8,
        };
        hash_parts(b"BITCRAPS_DISPUTE_VOTE", &[dispute_id, voter, &[tag]])
    }

    pub fn verify(&self) -> bool {
        verify_signature(
            &self.voter,
            &Self::signing_payload(&self.dispute_id, &self.voter, self.vote),
            &self.signature,
        )
    }
}

/// Uphold/Reject tally for one dispute
#[derive(Debug, Clone, Default)]
pub struct DisputeVoteTracker {
    pub uphold: BTreeSet<PeerId>,
    pub reject: BTreeSet<PeerId>,
}

impl DisputeVoteTracker {
    pub fn record(&mut self, voter: PeerId, vote: DisputeVoteType) -> Result<()> {
        if self.uphold.contains(&voter) || self.reject.contains(&voter) {
            return Err(Error::DuplicateVote(format!(
                "{} already voted on this dispute",
                short_hex(&voter)
            )));
        }
        match vote {
            DisputeVoteType::Uphold => self.uphold.insert(voter),
            DisputeVoteType::Reject => self.reject.insert(voter),
        };
        Ok(())
    }

    /// First side to reach `required` wins
    pub fn decision(&self, required: usize) -> Option<DisputeOutcome> {
        if self.uphold.len() >= required {
            Some(DisputeOutcome::Upheld)
        } else if self.reject.len() >= required {
            Some(DisputeOutcome::Rejected)
        } else {
            None
        }
    }
}

/// Open disputes and their tallies
pub struct DisputeManager {
    config: DisputeConfig,
    active: FxHashMap<DisputeId, (Dispute, DisputeVoteTracker)>,
    resolved: LruCache<DisputeId, DisputeOutcome>,
}

impl DisputeManager {
    pub fn new(config: DisputeConfig) -> Self {
        Self {
            config,
            active: FxHashMap::default(),
            resolved: LruCache::new(NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn config(&self) -> &DisputeConfig {
        &self.config
    }

    /// Track a dispute. Returns false if it is already known.
    pub fn open(&mut self, dispute: Dispute) -> Result<bool> {
        if self.active.contains_key(&dispute.id) || self.resolved.contains(&dispute.id) {
            return Ok(false);
        }
        if self.active.len() >= self.config.max_active_disputes {
            return Err(Error::ResourceExhausted(format!(
                "{} disputes already open",
                self.active.len()
            )));
        }
        if dispute.evidence.len() > self.config.max_evidence_items {
            return Err(Error::InvalidOperation(format!(
                "dispute carries {} evidence items, limit is {}",
                dispute.evidence.len(),
                self.config.max_evidence_items
            )));
        }
        log::info!(
            "Dispute {} opened by {}: {:?}",
            short_hex(&dispute.id),
            short_hex(&dispute.disputer),
            dispute.claim
        );
        self.active
            .insert(dispute.id, (dispute, DisputeVoteTracker::default()));
        Ok(true)
    }

    /// Record a vote and resolve the dispute once a side reaches the threshold
    pub fn record_vote(
        &mut self,
        vote: &DisputeVote,
        participants: usize,
        now: u64,
    ) -> Result<Option<DisputeResolution>> {
        let Some((dispute, tracker)) = self.active.get_mut(&vote.dispute_id) else {
            return Err(if self.resolved.contains(&vote.dispute_id) {
                Error::DisputeExpired(format!("dispute {} already resolved", short_hex(&vote.dispute_id)))
            } else {
                Error::DisputeNotFound(short_hex(&vote.dispute_id))
            });
        };
        if now > dispute.resolution_deadline {
            return Err(Error::DisputeExpired(format!(
                "dispute {} passed its deadline",
                short_hex(&vote.dispute_id)
            )));
        }
        tracker.record(vote.voter, vote.vote)?;

        match tracker.decision(byzantine_threshold(participants)) {
            Some(outcome) => Ok(self.resolve(vote.dispute_id, outcome, false)),
            None => Ok(None),
        }
    }

    /// Auto-reject disputes whose deadline passed without a decision
    pub fn expire_at(&mut self, now: u64) -> Vec<DisputeResolution> {
        let expired: Vec<DisputeId> = self
            .active
            .iter()
            .filter(|(_, (dispute, _))| now > dispute.resolution_deadline)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.resolve(id, DisputeOutcome::Rejected, true))
            .collect()
    }

    fn resolve(&mut self, dispute_id: DisputeId, outcome: DisputeOutcome, expired: bool) -> Option<DisputeResolution> {
        let (dispute, tracker) = self.active.remove(&dispute_id)?;
        self.resolved.put(dispute_id, outcome);
        log::info!(
            "Dispute {} resolved {:?} ({} uphold, {} reject{})",
            short_hex(&dispute_id),
            outcome,
            tracker.uphold.len(),
            tracker.reject.len(),
            if expired { ", deadline" } else { "" }
        );
        let compensation = match outcome {
            DisputeOutcome::Upheld => dispute.compensating_operation(),
            DisputeOutcome::Rejected => None,
        };
        Some(DisputeResolution {
            dispute_id,
            disputer: dispute.disputer,
            outcome,
            compensation,
            expired,
        })
    }

    pub fn get(&self, dispute_id: &DisputeId) -> Option<&Dispute> {
        self.active.get(dispute_id).map(|(dispute, _)| dispute)
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn outcome(&self, dispute_id: &DisputeId) -> Option<DisputeOutcome> {
        self.resolved.peek(dispute_id).copied()
    }
}
