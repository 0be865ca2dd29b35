//! Core consensus engine implementation
//!
//! The engine is the single writer for one game session. It owns the current
//! finalized state, every pending proposal and its votes, the randomness
//! rounds, the open disputes and the fork registry. Callers hand it
//! operations and peer messages and get explicit outcomes back; nothing here
//! blocks or awaits.

use lru::LruCache;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::time::SystemTime;

use crate::crypto::{hash_parts, verify_signature, SigningKeyPair};
use crate::error::{Error, Result};
use crate::protocol::craps::CrapsGame;
use crate::protocol::{
    current_timestamp, short_hex, Bet, BetType, CrapTokens, DiceRoll, GameId, Hash256, PeerId,
    Signature, TREASURY_ADDRESS,
};

use super::byzantine::{ByzantineAlert, VotingPatternDetector};
use super::commit_reveal::{
    DiceOutcome, RandomnessCommit, RandomnessConfig, RandomnessCoordinator, RandomnessReveal,
    RoundEvent,
};
use super::forks::{ChainLink, ForkRegistry, ForkResolution};
use super::validation::{
    Dispute, DisputeClaim, DisputeConfig, DisputeEvidence, DisputeManager, DisputeResolution,
    DisputeVote, DisputeVoteType,
};
use super::voting::{SignedVote, VoteChoice, VoteTracker};
use super::{
    byzantine_threshold, participation_threshold, ConsensusConfig, ConsensusMetrics, DisputeId,
    ProposalId, RoundId, StateHash,
};

/// Membership and genesis parameters agreed when the session was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    pub game_id: GameId,
    /// Sorted, without duplicates
    pub participants: Vec<PeerId>,
    /// Agreed creation time, part of the genesis hash
    pub created_at: u64,
}

impl GameSession {
    pub fn new(game_id: GameId, mut participants: Vec<PeerId>, created_at: u64) -> Result<Self> {
        participants.sort_unstable();
        participants.dedup();
        if participants.is_empty() {
            return Err(Error::Config("a session needs at least one participant".to_string()));
        }
        if participants.contains(&TREASURY_ADDRESS) {
            return Err(Error::Config("the treasury cannot be a participant".to_string()));
        }
        Ok(Self {
            game_id,
            participants,
            created_at,
        })
    }
}

/// Game consensus state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameConsensusState {
    pub game_id: GameId,
    pub state_hash: StateHash,
    pub sequence_number: u64,
    pub timestamp: u64,

    // Core game state
    pub game_state: CrapsGame,
    pub player_balances: BTreeMap<PeerId, CrapTokens>,

    // Consensus metadata, excluded from the hash
    pub last_proposer: PeerId,
    pub confirmations: u32,
    pub is_finalized: bool,
}

/// Hashed view of a state: everything but the hash itself and the metadata
#[derive(Serialize)]
struct HashedContent<'a> {
    game_id: &'a GameId,
    sequence_number: u64,
    timestamp: u64,
    game_state: &'a CrapsGame,
    player_balances: &'a BTreeMap<PeerId, CrapTokens>,
    last_proposer: &'a PeerId,
}

impl GameConsensusState {
    /// Sequence 0 state, identical on every peer of the session
    pub fn genesis(session: &GameSession, config: &ConsensusConfig) -> Result<Self> {
        let mut player_balances: BTreeMap<PeerId, CrapTokens> = session
            .participants
            .iter()
            .map(|&p| (p, CrapTokens::new(config.initial_balance)))
            .collect();
        player_balances.insert(TREASURY_ADDRESS, CrapTokens::new(config.treasury_balance));

        let mut state = Self {
            game_id: session.game_id,
            state_hash: [0u8; 32],
            sequence_number: 0,
            timestamp: session.created_at,
            game_state: CrapsGame::new(session.game_id),
            player_balances,
            last_proposer: [0u8; 32],
            confirmations: 0,
            is_finalized: true,
        };
        state.state_hash = state.compute_hash()?;
        Ok(state)
    }

    /// Content hash. Balances are hashed in key order.
    pub fn compute_hash(&self) -> Result<StateHash> {
        let content = HashedContent {
            game_id: &self.game_id,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            game_state: &self.game_state,
            player_balances: &self.player_balances,
            last_proposer: &self.last_proposer,
        };
        let bytes = bincode::serialize(&content)?;
        Ok(hash_parts(b"BITCRAPS_STATE", &[&bytes]))
    }

    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.compute_hash()? == self.state_hash)
    }

    /// Sum of all balances, treasury included
    pub fn total_balance(&self) -> u128 {
        self.player_balances
            .values()
            .map(|tokens| u128::from(tokens.amount()))
            .sum()
    }

    pub fn balance_of(&self, peer: &PeerId) -> CrapTokens {
        self.player_balances.get(peer).copied().unwrap_or_default()
    }
}

/// Operations that can be proposed to change game state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameOperation {
    PlaceBet {
        player: PeerId,
        bet_type: BetType,
        amount: CrapTokens,
    },
    CancelBet {
        player: PeerId,
        bet_type: BetType,
    },
    ProcessRoll {
        round_id: RoundId,
        dice_values: Vec<u8>,
        entropy_proof: Vec<Hash256>,
    },
    UpdateBalances {
        changes: BTreeMap<PeerId, i64>,
        reason: String,
    },
}

impl GameOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            GameOperation::PlaceBet { .. } => "place_bet",
            GameOperation::CancelBet { .. } => "cancel_bet",
            GameOperation::ProcessRoll { .. } => "process_roll",
            GameOperation::UpdateBalances { .. } => "update_balances",
        }
    }
}

/// Game state proposal for consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameProposal {
    pub id: ProposalId,
    pub proposer: PeerId,
    pub previous_state_hash: StateHash,
    pub proposed_state: GameConsensusState,
    pub operation: GameOperation,
    pub timestamp: u64,
    pub signature: Signature,
}

impl GameProposal {
    /// Deterministic id from proposer, base state and operation content
    pub fn compute_id(proposer: &PeerId, previous_state_hash: &StateHash, operation: &GameOperation) -> Result<ProposalId> {
        let op_bytes = bincode::serialize(operation)?;
        Ok(hash_parts(b"BITCRAPS_PROPOSAL", &[proposer, previous_state_hash, &op_bytes]))
    }

    pub fn new_signed(
        keys: &SigningKeyPair,
        previous_state_hash: StateHash,
        proposed_state: GameConsensusState,
        operation: GameOperation,
        timestamp: u64,
    ) -> Result<Self> {
        let proposer = keys.peer_id();
        let id = Self::compute_id(&proposer, &previous_state_hash, &operation)?;
        let mut proposal = Self {
            id,
            proposer,
            previous_state_hash,
            proposed_state,
            operation,
            timestamp,
            signature: Signature([0u8; 64]),
        };
        proposal.signature = keys.sign(&proposal.signing_payload());
        Ok(proposal)
    }

    fn signing_payload(&self) -> Hash256 {
        hash_parts(
            b"BITCRAPS_PROPOSAL_SIG",
            &[
                &self.id,
                &self.proposer,
                &self.previous_state_hash,
                &self.proposed_state.state_hash,
                &self.timestamp.to_le_bytes(),
            ],
        )
    }

    /// Check id, candidate hash and signature
    pub fn verify(&self) -> Result<()> {
        let expected = Self::compute_id(&self.proposer, &self.previous_state_hash, &self.operation)?;
        if expected != self.id {
            return Err(Error::InvalidProposal(format!(
                "proposal {} id does not match its content",
                short_hex(&self.id)
            )));
        }
        if !self.proposed_state.verify_hash()? {
            return Err(Error::InvalidProposal(format!(
                "proposal {} carries a mislabelled state hash",
                short_hex(&self.id)
            )));
        }
        if !verify_signature(&self.proposer, &self.signing_payload(), &self.signature) {
            return Err(Error::InvalidSignature(format!(
                "proposal {} from {}",
                short_hex(&self.id),
                short_hex(&self.proposer)
            )));
        }
        Ok(())
    }
}

/// Proof that a proposal was finalized: the proposal plus its approvals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalityCertificate {
    pub proposal: GameProposal,
    pub approvals: Vec<SignedVote>,
}

impl FinalityCertificate {
    /// Count distinct valid approvals, failing below the Byzantine threshold
    pub fn verify_approvals(&self, participants: &[PeerId]) -> Result<usize> {
        let mut seen = HashSet::new();
        for vote in &self.approvals {
            if vote.proposal_id != self.proposal.id || vote.choice != VoteChoice::Approve {
                return Err(Error::InvalidProposal(format!(
                    "certificate for {} carries an unrelated vote",
                    short_hex(&self.proposal.id)
                )));
            }
            if !participants.contains(&vote.voter) {
                return Err(Error::UnknownPeer(short_hex(&vote.voter)));
            }
            if !seen.insert(vote.voter) {
                return Err(Error::DuplicateVote(format!(
                    "{} appears twice in certificate",
                    short_hex(&vote.voter)
                )));
            }
            if !vote.verify() {
                return Err(Error::InvalidSignature(format!(
                    "approval from {} in certificate",
                    short_hex(&vote.voter)
                )));
            }
        }
        let required = byzantine_threshold(participants.len());
        if seen.len() < required {
            return Err(Error::InsufficientVotes(format!(
                "certificate has {} approvals, {} required",
                seen.len(),
                required
            )));
        }
        Ok(seen.len())
    }
}

/// A proposal that just became the current state
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedProposal {
    pub proposal_id: ProposalId,
    pub proposer: PeerId,
    pub operation: GameOperation,
    pub state: GameConsensusState,
    pub certificate: FinalityCertificate,
    /// Pending proposals built on the replaced state, now rejected
    pub superseded: Vec<ProposalId>,
}

/// Result of feeding a vote into the engine
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Pending {
        votes_for: usize,
        votes_against: usize,
        abstentions: usize,
    },
    Finalized(Box<FinalizedProposal>),
    Rejected {
        proposal_id: ProposalId,
        reason: String,
    },
    /// Held until the proposal arrives
    Buffered,
    /// Vote for a proposal that was already decided
    Stale,
}

/// Local vote cast on a proposal plus where that leaves it
#[derive(Debug, Clone)]
pub struct ProposalVerdict {
    pub proposal_id: ProposalId,
    pub vote: SignedVote,
    pub outcome: VoteOutcome,
}

/// Result of processing a finality certificate
#[derive(Debug, Clone)]
pub enum CertificateOutcome {
    AlreadyApplied,
    Applied(Box<FinalizedProposal>),
    /// The certificate is further ahead than one step; wait for state sync
    Behind {
        local_sequence: u64,
        remote_sequence: u64,
    },
    /// Fork registered but its ancestor state is no longer held locally
    ForkDetected { fork_id: StateHash },
    ForkResolved {
        resolution: ForkResolution,
        orphaned_operations: Vec<GameOperation>,
        superseded: Vec<ProposalId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Finalized,
    Rejected,
    Expired,
}

/// Main consensus engine for BitCraps
pub struct ConsensusEngine {
    config: ConsensusConfig,
    session: GameSession,
    keys: SigningKeyPair,
    local_peer_id: PeerId,

    // Current consensus state
    current_state: GameConsensusState,
    state_history: VecDeque<GameConsensusState>,
    pending_proposals: FxHashMap<ProposalId, GameProposal>,
    /// Certificate of the transition that produced `current_state`
    latest_certificate: Option<FinalityCertificate>,

    // Voting
    votes: FxHashMap<ProposalId, VoteTracker>,
    approvals: FxHashMap<ProposalId, Vec<SignedVote>>,
    orphan_votes: FxHashMap<ProposalId, (SystemTime, Vec<SignedVote>)>,
    orphan_vote_count: usize,
    decided: LruCache<ProposalId, ProposalStatus>,

    // Fork management
    forks: ForkRegistry,

    // Commit-reveal for randomness
    randomness: RandomnessCoordinator,

    // Dispute tracking
    disputes: DisputeManager,

    detector: VotingPatternDetector,
    consensus_metrics: ConsensusMetrics,
}

impl ConsensusEngine {
    /// Create new consensus engine
    pub fn new(session: GameSession, keys: SigningKeyPair, config: ConsensusConfig) -> Result<Self> {
        let local_peer_id = keys.peer_id();
        if !session.participants.contains(&local_peer_id) {
            return Err(Error::UnknownPeer(format!(
                "local peer {} is not part of the session",
                short_hex(&local_peer_id)
            )));
        }

        let genesis = GameConsensusState::genesis(&session, &config)?;
        let forks = ForkRegistry::new(
            ChainLink::genesis(genesis.state_hash, genesis.timestamp),
            config.max_forks,
        );
        let randomness = RandomnessCoordinator::new(
            local_peer_id,
            session.participants.clone(),
            RandomnessConfig::default(),
        );
        let decided_capacity = NonZeroUsize::new(config.decided_cache_size).unwrap_or(NonZeroUsize::MIN);
        let detector = VotingPatternDetector::new(config.low_participation_percent, config.vote_skew_percent);

        log::info!(
            "Consensus engine for game {} started with {} participants",
            short_hex(&session.game_id),
            session.participants.len()
        );

        Ok(Self {
            config,
            keys,
            local_peer_id,
            state_history: VecDeque::from([genesis.clone()]),
            current_state: genesis,
            pending_proposals: FxHashMap::default(),
            latest_certificate: None,
            votes: FxHashMap::default(),
            approvals: FxHashMap::default(),
            orphan_votes: FxHashMap::default(),
            orphan_vote_count: 0,
            decided: LruCache::new(decided_capacity),
            forks,
            randomness,
            disputes: DisputeManager::new(DisputeConfig::default()),
            detector,
            consensus_metrics: ConsensusMetrics::default(),
            session,
        })
    }

    pub fn with_randomness_config(mut self, config: RandomnessConfig) -> Self {
        self.randomness = RandomnessCoordinator::new(self.local_peer_id, self.session.participants.clone(), config);
        self
    }

    pub fn with_dispute_config(mut self, config: DisputeConfig) -> Self {
        self.disputes = DisputeManager::new(config);
        self
    }

    // Accessors

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn game_id(&self) -> GameId {
        self.session.game_id
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.session.participants
    }

    pub fn is_participant(&self, peer: &PeerId) -> bool {
        self.session.participants.binary_search(peer).is_ok()
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Get current consensus state
    pub fn get_current_state(&self) -> &GameConsensusState {
        &self.current_state
    }

    /// Get consensus metrics
    pub fn get_metrics(&self) -> &ConsensusMetrics {
        &self.consensus_metrics
    }

    /// Get active proposals
    pub fn get_pending_proposals(&self) -> &FxHashMap<ProposalId, GameProposal> {
        &self.pending_proposals
    }

    pub fn get_proposal(&self, proposal_id: &ProposalId) -> Option<&GameProposal> {
        self.pending_proposals.get(proposal_id)
    }

    pub fn vote_tracker(&self, proposal_id: &ProposalId) -> Option<&VoteTracker> {
        self.votes.get(proposal_id)
    }

    pub fn proposal_status(&self, proposal_id: &ProposalId) -> Option<ProposalStatus> {
        self.decided.peek(proposal_id).copied()
    }

    /// Proof for the current state, `None` at genesis
    pub fn latest_certificate(&self) -> Option<&FinalityCertificate> {
        self.latest_certificate.as_ref()
    }

    pub fn canonical_chain(&self) -> &[ChainLink] {
        self.forks.canonical_chain()
    }

    pub fn byzantine_alerts(&self) -> impl Iterator<Item = &ByzantineAlert> {
        self.detector.alerts()
    }

    pub fn get_dispute(&self, dispute_id: &DisputeId) -> Option<&Dispute> {
        self.disputes.get(dispute_id)
    }

    pub fn randomness_outcome(&self, round_id: RoundId) -> Option<&DiceOutcome> {
        self.randomness.outcome(round_id)
    }

    /// Local submissions are refused while a dispute is open
    pub fn is_frozen(&self) -> bool {
        self.config.freeze_on_dispute && self.disputes.has_active()
    }

    /// Check if consensus is healthy
    pub fn is_consensus_healthy(&self) -> bool {
        !self.is_frozen()
            && self.forks.unresolved_count() == 0
            && self.pending_proposals.len() < self.config.max_pending_proposals
    }

    // Proposal lifecycle

    /// Submit a new operation for consensus
    pub fn submit_operation(&mut self, operation: GameOperation) -> Result<ProposalId> {
        self.propose(operation).map(|(proposal, _)| proposal.id)
    }

    /// Create, sign and self-approve a proposal. The returned proposal and
    /// vote are what the caller broadcasts.
    pub fn propose(&mut self, operation: GameOperation) -> Result<(GameProposal, ProposalVerdict)> {
        if self.is_frozen() {
            return Err(Error::GameFrozen(format!(
                "{} open dispute(s)",
                self.disputes.active_count()
            )));
        }
        if self.pending_proposals.len() >= self.config.max_pending_proposals {
            return Err(Error::ResourceExhausted(format!(
                "{} proposals already pending",
                self.pending_proposals.len()
            )));
        }
        let base = self.current_state.state_hash;
        if self
            .pending_proposals
            .values()
            .any(|p| p.proposer == self.local_peer_id && p.previous_state_hash == base)
        {
            return Err(Error::SequenceConflict(format!(
                "a local proposal for sequence {} is already pending",
                self.current_state.sequence_number + 1
            )));
        }
        self.validate_against_local_view(&operation)?;

        let timestamp = current_timestamp();
        let proposed_state =
            Self::apply_operation(&self.config, &self.current_state, &operation, self.local_peer_id, timestamp)?;
        let proposal = GameProposal::new_signed(&self.keys, base, proposed_state, operation, timestamp)?;
        let proposal_id = proposal.id;

        log::debug!(
            "Proposing {} as {} at sequence {}",
            proposal.operation.kind(),
            short_hex(&proposal_id),
            proposal.proposed_state.sequence_number
        );

        self.decided.pop(&proposal_id);
        self.pending_proposals.insert(proposal_id, proposal.clone());
        self.votes.insert(proposal_id, VoteTracker::new(proposal_id));

        let vote = SignedVote::new(&self.keys, proposal_id, VoteChoice::Approve);
        let outcome = self.apply_vote(vote.clone())?;
        let outcome = self.replay_orphans(proposal_id, outcome);

        Ok((
            proposal,
            ProposalVerdict {
                proposal_id,
                vote,
                outcome,
            },
        ))
    }

    /// Process a proposal from another participant and cast the local vote.
    /// Returns `None` for a proposal that is already known.
    pub fn process_proposal(&mut self, proposal: GameProposal) -> Result<Option<ProposalVerdict>> {
        if !self.is_participant(&proposal.proposer) {
            return Err(Error::UnknownPeer(short_hex(&proposal.proposer)));
        }
        let proposal_id = proposal.id;
        if self.pending_proposals.contains_key(&proposal_id) {
            return Ok(None);
        }
        if matches!(
            self.decided.peek(&proposal_id),
            Some(ProposalStatus::Finalized | ProposalStatus::Rejected)
        ) {
            return Ok(None);
        }
        proposal.verify()?;
        self.consensus_metrics.signatures_verified += 1;

        let (choice, reason) = self.evaluate_proposal(&proposal);
        match &reason {
            Some(reason) => log::info!(
                "Voting {:?} on {} from {}: {}",
                choice,
                short_hex(&proposal_id),
                short_hex(&proposal.proposer),
                reason
            ),
            None => log::debug!("Voting {:?} on {}", choice, short_hex(&proposal_id)),
        }

        self.decided.pop(&proposal_id);
        self.pending_proposals.insert(proposal_id, proposal);
        self.votes.insert(proposal_id, VoteTracker::new(proposal_id));

        let vote = SignedVote::new(&self.keys, proposal_id, choice);
        let outcome = self.apply_vote(vote.clone())?;
        let outcome = self.replay_orphans(proposal_id, outcome);

        Ok(Some(ProposalVerdict {
            proposal_id,
            vote,
            outcome,
        }))
    }

    /// Process a vote from a peer
    pub fn process_peer_vote(&mut self, vote: SignedVote) -> Result<VoteOutcome> {
        if !self.is_participant(&vote.voter) {
            return Err(Error::UnknownPeer(short_hex(&vote.voter)));
        }
        if !vote.verify() {
            return Err(Error::InvalidSignature(format!(
                "vote from {} on {}",
                short_hex(&vote.voter),
                short_hex(&vote.proposal_id)
            )));
        }
        self.consensus_metrics.signatures_verified += 1;

        if self.votes.contains_key(&vote.proposal_id) {
            return self.apply_vote(vote);
        }
        if self.decided.contains(&vote.proposal_id) {
            log::debug!(
                "Late vote from {} for decided proposal {}",
                short_hex(&vote.voter),
                short_hex(&vote.proposal_id)
            );
            return Ok(VoteOutcome::Stale);
        }
        self.buffer_orphan(vote)?;
        Ok(VoteOutcome::Buffered)
    }

    /// Record a verified vote and re-evaluate the proposal
    fn apply_vote(&mut self, vote: SignedVote) -> Result<VoteOutcome> {
        let participants = self.session.participants.len();
        let proposal_id = vote.proposal_id;
        let tracker = self
            .votes
            .get_mut(&proposal_id)
            .ok_or_else(|| Error::UnknownProposal(short_hex(&proposal_id)))?;

        if let Some(previous) = tracker.choice_of(&vote.voter) {
            if previous != vote.choice {
                self.detector.record_equivocation(proposal_id, vote.voter);
                self.consensus_metrics.byzantine_alerts += 1;
            }
        }
        tracker.record(vote.voter, vote.choice)?;

        if self.detector.observe_vote(tracker, participants).is_some() {
            self.consensus_metrics.byzantine_alerts += 1;
        }
        if vote.choice == VoteChoice::Approve {
            self.approvals.entry(proposal_id).or_default().push(vote);
        }

        self.check_proposal_consensus(proposal_id)
    }

    /// Check if a proposal has reached consensus
    fn check_proposal_consensus(&mut self, proposal_id: ProposalId) -> Result<VoteOutcome> {
        let participants = self.session.participants.len();
        let tracker = self
            .votes
            .get(&proposal_id)
            .ok_or_else(|| Error::UnknownProposal(short_hex(&proposal_id)))?;

        let pending = VoteOutcome::Pending {
            votes_for: tracker.approvals(),
            votes_against: tracker.rejections(),
            abstentions: tracker.abstentions.len(),
        };
        if tracker.total_votes() < participation_threshold(participants) {
            return Ok(pending);
        }

        let required = byzantine_threshold(participants);
        if tracker.approvals() >= required {
            self.finalize_proposal(proposal_id)
        } else if tracker.rejections() >= required {
            Ok(self.reject_proposal(proposal_id, "rejected by participants".to_string()))
        } else {
            Ok(pending)
        }
    }

    /// Finalize an accepted proposal
    fn finalize_proposal(&mut self, proposal_id: ProposalId) -> Result<VoteOutcome> {
        let proposal = self
            .pending_proposals
            .get(&proposal_id)
            .cloned()
            .ok_or_else(|| Error::UnknownProposal(short_hex(&proposal_id)))?;

        if proposal.previous_state_hash != self.current_state.state_hash
            || !self.verify_state_transition(&proposal.proposed_state)
        {
            return Ok(self.reject_proposal(
                proposal_id,
                "approved transition does not extend the current state".to_string(),
            ));
        }

        let tracker = self.take_proposal(&proposal_id);
        let approvals = self.approvals.remove(&proposal_id).unwrap_or_default();
        let elapsed = tracker
            .as_ref()
            .and_then(|t| t.created_at.elapsed().ok())
            .unwrap_or_default();

        let confirmations = u32::try_from(approvals.len()).unwrap_or(u32::MAX);
        let state = self.install_state(proposal.proposed_state.clone(), confirmations, &proposal);
        self.decided.put(proposal_id, ProposalStatus::Finalized);
        self.consensus_metrics.record_finalization(elapsed);
        let superseded = self.purge_stale_proposals();

        log::info!(
            "Finalized {} {} at sequence {} with {} approvals",
            proposal.operation.kind(),
            short_hex(&proposal_id),
            state.sequence_number,
            confirmations
        );

        let certificate = FinalityCertificate { proposal, approvals };
        self.latest_certificate = Some(certificate.clone());

        Ok(VoteOutcome::Finalized(Box::new(FinalizedProposal {
            proposal_id,
            proposer: certificate.proposal.proposer,
            operation: certificate.proposal.operation.clone(),
            state,
            certificate,
            superseded,
        })))
    }

    /// Reject a proposal
    fn reject_proposal(&mut self, proposal_id: ProposalId, reason: String) -> VoteOutcome {
        self.take_proposal(&proposal_id);
        self.approvals.remove(&proposal_id);
        self.decided.put(proposal_id, ProposalStatus::Rejected);
        self.consensus_metrics.rounds_failed += 1;
        log::info!("Rejected proposal {}: {}", short_hex(&proposal_id), reason);
        VoteOutcome::Rejected { proposal_id, reason }
    }

    /// Remove a proposal and its tracker, running the participation check
    fn take_proposal(&mut self, proposal_id: &ProposalId) -> Option<VoteTracker> {
        self.pending_proposals.remove(proposal_id);
        let tracker = self.votes.remove(proposal_id)?;
        if self
            .detector
            .observe_decision(&tracker, self.session.participants.len())
            .is_some()
        {
            self.consensus_metrics.byzantine_alerts += 1;
        }
        self.detector.forget(proposal_id);
        Some(tracker)
    }

    /// Make a verified state current and extend the canonical chain
    fn install_state(&mut self, mut state: GameConsensusState, confirmations: u32, proposal: &GameProposal) -> GameConsensusState {
        state.confirmations = confirmations;
        state.is_finalized = true;
        self.forks.push_canonical(ChainLink {
            state_hash: state.state_hash,
            previous_state_hash: proposal.previous_state_hash,
            sequence_number: state.sequence_number,
            confirmations,
            timestamp: state.timestamp,
            proposal_id: Some(proposal.id),
            operation: Some(proposal.operation.clone()),
        });
        self.push_history(state.clone());
        self.current_state = state.clone();
        state
    }

    fn push_history(&mut self, state: GameConsensusState) {
        self.state_history.push_back(state);
        while self.state_history.len() > self.config.state_history.max(1) {
            self.state_history.pop_front();
        }
    }

    /// Reject every pending proposal that no longer builds on the current state
    fn purge_stale_proposals(&mut self) -> Vec<ProposalId> {
        let current = self.current_state.state_hash;
        let stale: Vec<ProposalId> = self
            .pending_proposals
            .iter()
            .filter(|(_, p)| p.previous_state_hash != current)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.reject_proposal(*id, "superseded by a newer state".to_string());
        }
        stale
    }

    fn buffer_orphan(&mut self, vote: SignedVote) -> Result<()> {
        if self.orphan_vote_count >= self.config.orphan_vote_limit {
            return Err(Error::ResourceExhausted(format!(
                "{} votes already waiting for their proposals",
                self.orphan_vote_count
            )));
        }
        let (_, bucket) = self
            .orphan_votes
            .entry(vote.proposal_id)
            .or_insert_with(|| (SystemTime::now(), Vec::new()));
        if bucket.iter().any(|v| v.voter == vote.voter) {
            return Err(Error::DuplicateVote(format!(
                "{} already has a buffered vote on {}",
                short_hex(&vote.voter),
                short_hex(&vote.proposal_id)
            )));
        }
        bucket.push(vote);
        self.orphan_vote_count += 1;
        Ok(())
    }

    fn replay_orphans(&mut self, proposal_id: ProposalId, outcome: VoteOutcome) -> VoteOutcome {
        let Some((_, buffered)) = self.orphan_votes.remove(&proposal_id) else {
            return outcome;
        };
        self.orphan_vote_count = self.orphan_vote_count.saturating_sub(buffered.len());

        let mut outcome = outcome;
        for vote in buffered {
            if !self.votes.contains_key(&proposal_id) {
                break;
            }
            match self.apply_vote(vote) {
                Ok(next) => outcome = next,
                Err(e) => log::debug!("Dropped buffered vote on {}: {}", short_hex(&proposal_id), e),
            }
        }
        outcome
    }

    /// Expire one pending proposal. Returns false if it was not pending.
    pub fn expire_proposal(&mut self, proposal_id: &ProposalId) -> bool {
        if !self.pending_proposals.contains_key(proposal_id) {
            return false;
        }
        self.take_proposal(proposal_id);
        self.approvals.remove(proposal_id);
        self.decided.put(*proposal_id, ProposalStatus::Expired);
        self.consensus_metrics.rounds_failed += 1;
        log::info!("Proposal {} expired without consensus", short_hex(proposal_id));
        true
    }

    /// Expire proposals and buffered votes older than the proposal timeout
    pub fn expire_stale_proposals(&mut self) -> Vec<ProposalId> {
        let timeout = self.config.proposal_timeout;
        let is_old = |created: &SystemTime| created.elapsed().map(|age| age >= timeout).unwrap_or(false);

        let expired: Vec<ProposalId> = self
            .votes
            .iter()
            .filter(|(_, tracker)| is_old(&tracker.created_at))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.expire_proposal(id);
        }

        let before = self.orphan_votes.len();
        self.orphan_votes.retain(|_, (created, _)| !is_old(created));
        if self.orphan_votes.len() != before {
            self.orphan_vote_count = self.orphan_votes.values().map(|(_, votes)| votes.len()).sum();
        }
        expired
    }

    // Validation

    /// Decide how to vote on a peer's proposal
    fn evaluate_proposal(&self, proposal: &GameProposal) -> (VoteChoice, Option<String>) {
        if self.is_frozen() {
            return (VoteChoice::Abstain, Some("dispute freeze in effect".to_string()));
        }
        if proposal.previous_state_hash != self.current_state.state_hash {
            return (
                VoteChoice::Reject,
                Some(format!(
                    "builds on {} but current state is {}",
                    short_hex(&proposal.previous_state_hash),
                    short_hex(&self.current_state.state_hash)
                )),
            );
        }
        if let Err(e) = self.validate_against_local_view(&proposal.operation) {
            return (VoteChoice::Reject, Some(e.to_string()));
        }
        let candidate = match Self::apply_operation(
            &self.config,
            &self.current_state,
            &proposal.operation,
            proposal.proposer,
            proposal.timestamp,
        ) {
            Ok(candidate) => candidate,
            Err(e) => return (VoteChoice::Reject, Some(e.to_string())),
        };
        if candidate.state_hash != proposal.proposed_state.state_hash {
            return (VoteChoice::Reject, Some("candidate state differs from local replay".to_string()));
        }
        if !self.verify_state_transition(&candidate) {
            return (VoteChoice::Reject, Some("state transition check failed".to_string()));
        }
        (VoteChoice::Approve, None)
    }

    /// Checks that depend on local knowledge rather than on the state alone
    fn validate_against_local_view(&self, operation: &GameOperation) -> Result<()> {
        if let GameOperation::ProcessRoll {
            round_id,
            dice_values,
            entropy_proof,
        } = operation
        {
            let roll = DiceRoll::from_values(dice_values)?;
            let outcome = self.randomness.outcome(*round_id).ok_or_else(|| {
                Error::InvalidOperation(format!("no completed randomness round {}", round_id))
            })?;
            if outcome.dice != roll || &outcome.entropy_proof != entropy_proof {
                return Err(Error::InvalidOperation(format!(
                    "roll does not match randomness round {}",
                    round_id
                )));
            }
        }
        Ok(())
    }

    /// Sequence continuity, clock window, conservation and hash integrity
    pub fn verify_state_transition(&self, candidate: &GameConsensusState) -> bool {
        self.verify_state_transition_at(candidate, current_timestamp())
    }

    pub fn verify_state_transition_at(&self, candidate: &GameConsensusState, now: u64) -> bool {
        let current = &self.current_state;
        if candidate.game_id != current.game_id {
            log::debug!("Transition rejected: wrong game");
            return false;
        }
        if candidate.sequence_number != current.sequence_number + 1 {
            log::debug!(
                "Transition rejected: sequence {} after {}",
                candidate.sequence_number,
                current.sequence_number
            );
            return false;
        }
        if candidate.timestamp.abs_diff(now) > self.config.max_clock_drift.as_secs() {
            log::debug!("Transition rejected: timestamp {} outside drift window", candidate.timestamp);
            return false;
        }
        if candidate.total_balance() > current.total_balance() {
            log::warn!("Transition rejected: total balance would increase");
            return false;
        }
        matches!(candidate.verify_hash(), Ok(true))
    }

    /// Apply an operation to a copy of `state`
    pub fn apply_operation(
        config: &ConsensusConfig,
        state: &GameConsensusState,
        operation: &GameOperation,
        proposer: PeerId,
        timestamp: u64,
    ) -> Result<GameConsensusState> {
        let mut next = state.clone();
        next.sequence_number = state
            .sequence_number
            .checked_add(1)
            .ok_or_else(|| Error::ArithmeticOverflow("sequence number".to_string()))?;
        next.timestamp = timestamp;
        next.last_proposer = proposer;
        next.confirmations = 0;
        next.is_finalized = false;

        match operation {
            GameOperation::PlaceBet {
                player,
                bet_type,
                amount,
            } => {
                Self::require_player(&next, player)?;
                if amount.amount() < config.min_bet || amount.amount() > config.max_bet {
                    return Err(Error::InvalidOperation(format!(
                        "bet of {} outside [{}, {}]",
                        amount.amount(),
                        config.min_bet,
                        config.max_bet
                    )));
                }
                Self::transfer(&mut next.player_balances, player, &TREASURY_ADDRESS, *amount)?;
                next.game_state.place_bet(Bet {
                    player: *player,
                    bet_type: *bet_type,
                    amount: *amount,
                })?;
            }
            GameOperation::CancelBet { player, bet_type } => {
                Self::require_player(&next, player)?;
                let bet = next.game_state.remove_bet(player, *bet_type).ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "{} has no {:?} bet to cancel",
                        short_hex(player),
                        bet_type
                    ))
                })?;
                Self::transfer(&mut next.player_balances, &TREASURY_ADDRESS, player, bet.amount)?;
            }
            GameOperation::ProcessRoll {
                round_id,
                dice_values,
                entropy_proof,
            } => {
                let roll = DiceRoll::from_values(dice_values)?;
                if entropy_proof.is_empty() {
                    return Err(Error::InvalidOperation("roll without entropy proof".to_string()));
                }
                if let Some(last) = next.game_state.last_round_id {
                    if *round_id <= last {
                        return Err(Error::InvalidOperation(format!(
                            "round {} is not after last applied round {}",
                            round_id, last
                        )));
                    }
                }
                let resolutions = next.game_state.process_roll(roll, *round_id)?;
                for resolution in &resolutions {
                    let returned = resolution.returned_to_player();
                    if returned.amount() > 0 {
                        Self::transfer(&mut next.player_balances, &TREASURY_ADDRESS, &resolution.player(), returned)?;
                    }
                }
            }
            GameOperation::UpdateBalances { changes, .. } => {
                if changes.is_empty() {
                    return Err(Error::InvalidOperation("empty balance update".to_string()));
                }
                let net: i128 = changes.values().map(|delta| i128::from(*delta)).sum();
                if net > 0 {
                    return Err(Error::InvalidOperation(format!(
                        "balance update would create {} tokens",
                        net
                    )));
                }
                for (peer, delta) in changes {
                    let balance = next
                        .player_balances
                        .get(peer)
                        .copied()
                        .ok_or_else(|| Error::UnknownPeer(short_hex(peer)))?;
                    let updated = i128::from(balance.amount()) + i128::from(*delta);
                    if updated < 0 {
                        return Err(Error::insufficient_balance_for(
                            "balance update",
                            delta.unsigned_abs(),
                            balance.amount(),
                        ));
                    }
                    let updated = u64::try_from(updated)
                        .map_err(|_| Error::ArithmeticOverflow("balance update".to_string()))?;
                    next.player_balances.insert(*peer, CrapTokens::new(updated));
                }
            }
        }

        next.state_hash = next.compute_hash()?;
        Ok(next)
    }

    fn require_player(state: &GameConsensusState, player: &PeerId) -> Result<()> {
        if *player == TREASURY_ADDRESS || !state.player_balances.contains_key(player) {
            return Err(Error::InvalidOperation(format!(
                "{} is not a participant",
                short_hex(player)
            )));
        }
        Ok(())
    }

    fn transfer(
        balances: &mut BTreeMap<PeerId, CrapTokens>,
        from: &PeerId,
        to: &PeerId,
        amount: CrapTokens,
    ) -> Result<()> {
        let from_balance = balances
            .get(from)
            .copied()
            .ok_or_else(|| Error::UnknownPeer(short_hex(from)))?;
        let debited = from_balance
            .checked_sub(amount)
            .map_err(|_| Error::insufficient_balance_for("transfer", amount.amount(), from_balance.amount()))?;
        balances.insert(*from, debited);

        let to_balance = balances
            .get(to)
            .copied()
            .ok_or_else(|| Error::UnknownPeer(short_hex(to)))?;
        balances.insert(*to, to_balance.checked_add(amount)?);
        Ok(())
    }

    // Certificates, forks and state sync

    /// Apply or compare a proposal finalized elsewhere
    pub fn process_certificate(&mut self, certificate: FinalityCertificate) -> Result<CertificateOutcome> {
        let proposal = &certificate.proposal;
        if !self.is_participant(&proposal.proposer) {
            return Err(Error::UnknownPeer(short_hex(&proposal.proposer)));
        }
        proposal.verify()?;
        let approvals = certificate.verify_approvals(&self.session.participants)?;
        self.consensus_metrics.signatures_verified += approvals as u64 + 1;

        let state_hash = proposal.proposed_state.state_hash;
        if self.forks.contains(&state_hash) {
            return Ok(CertificateOutcome::AlreadyApplied);
        }
        let confirmations = u32::try_from(approvals).unwrap_or(u32::MAX);

        if proposal.previous_state_hash == self.current_state.state_hash {
            let candidate = self.replay_certified(&self.current_state, proposal)?;
            if candidate.total_balance() > self.current_state.total_balance() {
                return Err(Error::InvalidState("certified transition increases total balance".to_string()));
            }
            let proposal_id = proposal.id;
            let elapsed = self
                .take_proposal(&proposal_id)
                .and_then(|t| t.created_at.elapsed().ok())
                .unwrap_or_default();
            self.approvals.remove(&proposal_id);

            let certificate_proposal = certificate.proposal.clone();
            let state = self.install_state(candidate, confirmations, &certificate_proposal);
            self.decided.put(proposal_id, ProposalStatus::Finalized);
            self.consensus_metrics.record_finalization(elapsed);
            let superseded = self.purge_stale_proposals();
            log::info!(
                "Applied certified {} {} at sequence {}",
                certificate_proposal.operation.kind(),
                short_hex(&proposal_id),
                state.sequence_number
            );
            self.latest_certificate = Some(certificate.clone());
            return Ok(CertificateOutcome::Applied(Box::new(FinalizedProposal {
                proposal_id,
                proposer: certificate_proposal.proposer,
                operation: certificate_proposal.operation.clone(),
                state,
                certificate,
                superseded,
            })));
        }

        let remote_sequence = proposal.proposed_state.sequence_number;
        if remote_sequence > self.current_state.sequence_number + 1
            || !self.forks.contains(&proposal.previous_state_hash)
        {
            return Ok(CertificateOutcome::Behind {
                local_sequence: self.current_state.sequence_number,
                remote_sequence,
            });
        }

        self.handle_fork(&certificate, confirmations)
    }

    /// Register a competing certified link and run fork choice on it
    fn handle_fork(&mut self, certificate: &FinalityCertificate, confirmations: u32) -> Result<CertificateOutcome> {
        let proposal = &certificate.proposal;
        let fork_id = proposal.proposed_state.state_hash;
        let link = ChainLink {
            state_hash: fork_id,
            previous_state_hash: proposal.previous_state_hash,
            sequence_number: proposal.proposed_state.sequence_number,
            confirmations,
            timestamp: proposal.proposed_state.timestamp,
            proposal_id: Some(proposal.id),
            operation: Some(proposal.operation.clone()),
        };
        self.forks.register_fork(link, current_timestamp())?;

        let Some(ancestor) = self
            .state_history
            .iter()
            .find(|s| s.state_hash == proposal.previous_state_hash)
            .cloned()
        else {
            log::warn!(
                "Fork {} cannot be evaluated: ancestor state no longer held",
                short_hex(&fork_id)
            );
            return Ok(CertificateOutcome::ForkDetected { fork_id });
        };

        let candidate = match self.replay_certified(&ancestor, proposal) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.forks.discard(&fork_id);
                return Err(e);
            }
        };

        let resolution = self.forks.resolve(&fork_id)?;
        self.consensus_metrics.forks_resolved += 1;

        let mut superseded = Vec::new();
        if resolution.adopted {
            while self
                .state_history
                .back()
                .is_some_and(|s| s.state_hash != ancestor.state_hash)
            {
                self.state_history.pop_back();
            }
            let mut adopted = candidate;
            adopted.confirmations = confirmations;
            adopted.is_finalized = true;
            self.push_history(adopted.clone());
            self.current_state = adopted;
            self.latest_certificate = Some(certificate.clone());
            self.decided.put(proposal.id, ProposalStatus::Finalized);
            superseded = self.purge_stale_proposals();
            log::warn!(
                "Adopted fork {} at sequence {}",
                short_hex(&fork_id),
                self.current_state.sequence_number
            );
        } else {
            log::warn!("Kept canonical chain over fork {}", short_hex(&fork_id));
        }

        let orphaned_operations = resolution
            .orphaned
            .iter()
            .filter_map(|link| link.operation.clone())
            .collect();
        Ok(CertificateOutcome::ForkResolved {
            resolution,
            orphaned_operations,
            superseded,
        })
    }

    /// Re-run a certified operation on `base` and check it lands on the certified hash
    fn replay_certified(&self, base: &GameConsensusState, proposal: &GameProposal) -> Result<GameConsensusState> {
        let candidate = Self::apply_operation(&self.config, base, &proposal.operation, proposal.proposer, proposal.timestamp)?;
        if candidate.state_hash != proposal.proposed_state.state_hash {
            return Err(Error::InvalidProposal(format!(
                "certified state {} does not match local replay",
                short_hex(&proposal.proposed_state.state_hash)
            )));
        }
        Ok(candidate)
    }

    /// Adopt a snapshot that is ahead of the local state.
    ///
    /// The snapshot must come with the finality certificate of the transition
    /// that produced it, signed by a Byzantine quorum of the session.
    /// Returns `Ok(false)` when the snapshot is not newer.
    pub fn sync_state(&mut self, snapshot: GameConsensusState, certificate: FinalityCertificate) -> Result<bool> {
        if snapshot.game_id != self.session.game_id {
            return Err(Error::InvalidState("snapshot belongs to another game".to_string()));
        }
        if snapshot.sequence_number <= self.current_state.sequence_number {
            return Ok(false);
        }
        if !snapshot.verify_hash()? {
            return Err(Error::StateChecksumMismatch(format!(
                "snapshot at sequence {} does not hash to {}",
                snapshot.sequence_number,
                short_hex(&snapshot.state_hash)
            )));
        }
        self.verify_snapshot_certificate(&snapshot, &certificate)?;
        if snapshot.total_balance() > self.current_state.total_balance() {
            return Err(Error::InvalidState("snapshot holds more tokens than the local state".to_string()));
        }

        let mut snapshot = snapshot;
        snapshot.is_finalized = true;
        self.forks.reset(ChainLink {
            state_hash: snapshot.state_hash,
            previous_state_hash: [0u8; 32],
            sequence_number: snapshot.sequence_number,
            confirmations: snapshot.confirmations,
            timestamp: snapshot.timestamp,
            proposal_id: None,
            operation: None,
        });
        self.state_history.clear();
        self.push_history(snapshot.clone());
        log::info!(
            "Synced state from sequence {} to {}",
            self.current_state.sequence_number,
            snapshot.sequence_number
        );
        self.current_state = snapshot;
        self.latest_certificate = Some(certificate);
        let superseded = self.purge_stale_proposals();
        if !superseded.is_empty() {
            log::debug!("State sync superseded {} pending proposal(s)", superseded.len());
        }
        Ok(true)
    }

    fn verify_snapshot_certificate(&mut self, snapshot: &GameConsensusState, certificate: &FinalityCertificate) -> Result<()> {
        let proposal = &certificate.proposal;
        if proposal.proposed_state.state_hash != snapshot.state_hash
            || proposal.proposed_state.sequence_number != snapshot.sequence_number
        {
            return Err(Error::InvalidState(format!(
                "certificate {} does not certify snapshot {}",
                short_hex(&proposal.id),
                short_hex(&snapshot.state_hash)
            )));
        }
        if !self.is_participant(&proposal.proposer) {
            return Err(Error::UnknownPeer(short_hex(&proposal.proposer)));
        }
        proposal.verify()?;
        let approvals = certificate.verify_approvals(&self.session.participants)?;
        self.consensus_metrics.signatures_verified += approvals as u64 + 1;
        Ok(())
    }

    // Randomness

    pub fn start_randomness_round(&mut self, round_id: RoundId) -> Result<RandomnessCommit> {
        self.start_randomness_round_at(round_id, current_timestamp())
    }

    pub fn start_randomness_round_at(&mut self, round_id: RoundId, now: u64) -> Result<RandomnessCommit> {
        self.randomness.begin_round(round_id, now, &self.keys)
    }

    pub fn process_randomness_commit(&mut self, commit: RandomnessCommit) -> Result<Vec<RoundEvent>> {
        self.process_randomness_commit_at(commit, current_timestamp())
    }

    pub fn process_randomness_commit_at(&mut self, commit: RandomnessCommit, now: u64) -> Result<Vec<RoundEvent>> {
        let events = self.randomness.add_commit(commit, now, &self.keys)?;
        self.consensus_metrics.signatures_verified += 1;
        self.count_round_events(&events);
        Ok(events)
    }

    pub fn process_randomness_reveal(&mut self, reveal: RandomnessReveal) -> Result<Vec<RoundEvent>> {
        let events = self.randomness.add_reveal(reveal)?;
        self.consensus_metrics.signatures_verified += 1;
        self.count_round_events(&events);
        Ok(events)
    }

    /// Close randomness rounds whose deadlines passed
    pub fn expire_randomness_at(&mut self, now: u64) -> Vec<RoundEvent> {
        let events = self.randomness.expire_at(now, &self.keys);
        self.count_round_events(&events);
        events
    }

    fn count_round_events(&mut self, events: &[RoundEvent]) {
        for event in events {
            match event {
                RoundEvent::Completed(_) => self.consensus_metrics.randomness_rounds_completed += 1,
                RoundEvent::Aborted { .. } => self.consensus_metrics.randomness_rounds_aborted += 1,
                _ => {}
            }
        }
    }

    /// Build the `ProcessRoll` operation for a completed round
    pub fn roll_operation(&self, round_id: RoundId) -> Result<GameOperation> {
        let outcome = self
            .randomness
            .outcome(round_id)
            .ok_or_else(|| Error::Randomness(format!("round {} has no outcome", round_id)))?;
        Ok(GameOperation::ProcessRoll {
            round_id,
            dice_values: vec![outcome.dice.die1, outcome.dice.die2],
            entropy_proof: outcome.entropy_proof.clone(),
        })
    }

    // Disputes

    /// Raise a dispute about the current state
    pub fn raise_dispute(&mut self, claim: DisputeClaim, evidence: Vec<DisputeEvidence>) -> Result<DisputeId> {
        self.raise_dispute_at(claim, evidence, current_timestamp())
    }

    pub fn raise_dispute_at(&mut self, claim: DisputeClaim, evidence: Vec<DisputeEvidence>, now: u64) -> Result<DisputeId> {
        let dispute = Dispute::new(
            &self.keys,
            self.current_state.state_hash,
            claim,
            evidence,
            now,
            self.disputes.config().resolution_timeout,
        )?;
        let dispute_id = dispute.id;
        self.disputes.open(dispute)?;
        Ok(dispute_id)
    }

    /// Track a dispute raised by a peer. Returns false if already known.
    pub fn process_dispute(&mut self, dispute: Dispute) -> Result<bool> {
        if !self.is_participant(&dispute.disputer) {
            return Err(Error::UnknownPeer(short_hex(&dispute.disputer)));
        }
        if !dispute.verify()? {
            return Err(Error::InvalidSignature(format!(
                "dispute {} from {}",
                short_hex(&dispute.id),
                short_hex(&dispute.disputer)
            )));
        }
        self.consensus_metrics.signatures_verified += 1;
        self.disputes.open(dispute)
    }

    /// Vote on a dispute
    pub fn vote_on_dispute(
        &mut self,
        dispute_id: DisputeId,
        vote: DisputeVoteType,
        reasoning: String,
    ) -> Result<(DisputeVote, Option<DisputeResolution>)> {
        self.vote_on_dispute_at(dispute_id, vote, reasoning, current_timestamp())
    }

    pub fn vote_on_dispute_at(
        &mut self,
        dispute_id: DisputeId,
        vote: DisputeVoteType,
        reasoning: String,
        now: u64,
    ) -> Result<(DisputeVote, Option<DisputeResolution>)> {
        let dispute_vote = DisputeVote::new(&self.keys, dispute_id, vote, reasoning, now);
        let resolution = self.record_dispute_vote(&dispute_vote, now)?;
        Ok((dispute_vote, resolution))
    }

    pub fn process_dispute_vote(&mut self, vote: DisputeVote) -> Result<Option<DisputeResolution>> {
        self.process_dispute_vote_at(vote, current_timestamp())
    }

    pub fn process_dispute_vote_at(&mut self, vote: DisputeVote, now: u64) -> Result<Option<DisputeResolution>> {
        if !self.is_participant(&vote.voter) {
            return Err(Error::UnknownPeer(short_hex(&vote.voter)));
        }
        if !vote.verify() {
            return Err(Error::InvalidSignature(format!(
                "dispute vote from {}",
                short_hex(&vote.voter)
            )));
        }
        self.consensus_metrics.signatures_verified += 1;
        self.record_dispute_vote(&vote, now)
    }

    fn record_dispute_vote(&mut self, vote: &DisputeVote, now: u64) -> Result<Option<DisputeResolution>> {
        let resolution = self
            .disputes
            .record_vote(vote, self.session.participants.len(), now)?;
        if resolution.is_some() {
            self.consensus_metrics.disputes_resolved += 1;
        }
        Ok(resolution)
    }

    /// Auto-reject disputes past their deadline
    pub fn expire_disputes_at(&mut self, now: u64) -> Vec<DisputeResolution> {
        let resolutions = self.disputes.expire_at(now);
        self.consensus_metrics.disputes_resolved += resolutions.len() as u64;
        resolutions
    }
}
