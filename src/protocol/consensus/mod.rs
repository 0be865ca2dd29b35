//! BitCraps Consensus Mechanism for Decentralized Game State Agreement
//!
//! This module implements the consensus system that lets the players of one
//! craps session agree on game state without a central authority.
//!
//! ## Key Features:
//! - Proposal/vote state machine with a `floor(2n/3)+1` agreement threshold
//! - Exactly-once signed voting, with equivocation reported as Byzantine behaviour
//! - Dice roll consensus using a commit-reveal scheme
//! - Dispute resolution with compensating operations
//! - Fork detection from finality certificates and deterministic fork choice
//!
//! ## Architecture:
//! - `engine`: the single-writer state machine owning everything below
//! - `voting`: per-proposal vote tracking
//! - `commit_reveal`: randomness rounds and the entropy pool
//! - `validation`: disputes, evidence and dispute votes
//! - `forks`: canonical chain pointer and competing branches
//! - `byzantine`: advisory voting pattern detection

pub mod byzantine;
pub mod commit_reveal;
pub mod engine;
pub mod forks;
pub mod validation;
pub mod voting;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{Hash256, INITIAL_CRAP_TOKENS, INITIAL_TREASURY_TOKENS, MAX_BET_AMOUNT, MIN_BET_AMOUNT};

// Re-export main types
pub use byzantine::{ByzantineAlert, VotingPatternDetector};
pub use commit_reveal::{
    DiceOutcome, EntropyPool, RandomnessCommit, RandomnessConfig, RandomnessCoordinator,
    RandomnessReveal, RoundEvent,
};
pub use engine::{
    CertificateOutcome, ConsensusEngine, FinalityCertificate, FinalizedProposal, GameConsensusState,
    GameOperation, GameProposal, GameSession, ProposalStatus, ProposalVerdict, VoteOutcome,
};
pub use forks::{ChainLink, Fork, ForkRegistry, ForkResolution};
pub use validation::{
    Dispute, DisputeClaim, DisputeConfig, DisputeEvidence, DisputeManager, DisputeOutcome,
    DisputeResolution, DisputeVote, DisputeVoteType,
};
pub use voting::{SignedVote, VoteChoice, VoteTracker};

/// Consensus constants
pub const CONSENSUS_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CLOCK_DRIFT: Duration = Duration::from_secs(300);
pub const MAX_PENDING_PROPOSALS: usize = 32;

// Type aliases for commonly used types
pub type ProposalId = Hash256;
pub type RoundId = u64;
pub type StateHash = Hash256;
pub type DisputeId = Hash256;

/// Votes needed to finalize or reject: `floor(2n/3) + 1`
pub fn byzantine_threshold(participants: usize) -> usize {
    (participants * 2) / 3 + 1
}

/// Votes that must be cast before a decision is considered: `floor(2n/3)`
pub fn participation_threshold(participants: usize) -> usize {
    (participants * 2) / 3
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Allowed distance between a candidate state's timestamp and local time
    #[serde(with = "humantime_serde")]
    pub max_clock_drift: Duration,
    /// Pending proposals older than this are expired by the engine
    #[serde(with = "humantime_serde")]
    pub proposal_timeout: Duration,
    pub max_pending_proposals: usize,
    pub initial_balance: u64,
    pub treasury_balance: u64,
    pub min_bet: u64,
    pub max_bet: u64,
    /// Refuse local submissions and abstain on peer proposals while a dispute is open
    pub freeze_on_dispute: bool,
    /// Remembered decided proposal ids, for stale-vote detection
    pub decided_cache_size: usize,
    /// Votes held for proposals that have not arrived yet
    pub orphan_vote_limit: usize,
    /// Finalized states kept so a winning fork can be replayed on its ancestor
    pub state_history: usize,
    pub max_forks: usize,
    pub low_participation_percent: u8,
    pub vote_skew_percent: u8,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            max_clock_drift: MAX_CLOCK_DRIFT,
            proposal_timeout: CONSENSUS_TIMEOUT,
            max_pending_proposals: MAX_PENDING_PROPOSALS,
            initial_balance: INITIAL_CRAP_TOKENS,
            treasury_balance: INITIAL_TREASURY_TOKENS,
            min_bet: MIN_BET_AMOUNT,
            max_bet: MAX_BET_AMOUNT,
            freeze_on_dispute: true,
            decided_cache_size: 1024,
            orphan_vote_limit: 256,
            state_history: 64,
            max_forks: 8,
            low_participation_percent: 50,
            vote_skew_percent: 90,
        }
    }
}

/// Consensus performance metrics
#[derive(Debug, Default, Clone)]
pub struct ConsensusMetrics {
    /// Total consensus rounds completed
    pub rounds_completed: u64,

    /// Total consensus rounds failed (rejected or expired)
    pub rounds_failed: u64,

    /// Average time from proposal to finalization (milliseconds)
    pub avg_consensus_time_ms: f64,

    /// Fork events resolved
    pub forks_resolved: u32,

    /// Signature verification count
    pub signatures_verified: u64,

    /// Advisory Byzantine alerts raised
    pub byzantine_alerts: u64,

    pub randomness_rounds_completed: u64,
    pub randomness_rounds_aborted: u64,
    pub disputes_resolved: u64,
}

impl ConsensusMetrics {
    pub(crate) fn record_finalization(&mut self, elapsed: Duration) {
        let n = self.rounds_completed as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_consensus_time_ms = (self.avg_consensus_time_ms * n + ms) / (n + 1.0);
        self.rounds_completed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert_eq!(byzantine_threshold(4), 3);
        assert_eq!(participation_threshold(4), 2);
        assert_eq!(byzantine_threshold(3), 3);
        assert_eq!(byzantine_threshold(7), 5);
        assert_eq!(participation_threshold(7), 4);
        assert_eq!(byzantine_threshold(1), 1);
        assert_eq!(participation_threshold(1), 0);
    }

    #[test]
    fn test_average_consensus_time() {
        let mut metrics = ConsensusMetrics::default();
        metrics.record_finalization(Duration::from_millis(100));
        metrics.record_finalization(Duration::from_millis(300));
        assert_eq!(metrics.rounds_completed, 2);
        assert!((metrics.avg_consensus_time_ms - 200.0).abs() < 1e-6);
    }
}
