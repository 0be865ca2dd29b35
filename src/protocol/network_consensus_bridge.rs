//! Network Consensus Bridge
//!
//! Adapts the synchronous consensus engine to asynchronous P2P delivery.
//! The engine sits behind a `parking_lot` mutex that is only ever held for
//! short synchronous sections; everything that has to go out on the wire is
//! collected while the lock is held and published after it is released.

use arc_swap::ArcSwap;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::crypto::SigningKeyPair;
use crate::error::{Error, ErrorSeverity, Result};
use crate::protocol::consensus::commit_reveal::RoundEvent;
use crate::protocol::consensus::engine::{
    CertificateOutcome, ConsensusEngine, FinalityCertificate, FinalizedProposal, GameConsensusState, GameOperation,
    ProposalStatus, VoteOutcome,
};
use crate::protocol::consensus::validation::{
    DisputeClaim, DisputeEvidence, DisputeOutcome, DisputeResolution, DisputeVoteType,
};
use crate::protocol::consensus::{
    byzantine_threshold, ConsensusMetrics, DisputeId, ProposalId, RoundId, StateHash,
};
use crate::protocol::p2p_messages::{CompressedGameState, ConsensusMessage, ConsensusPayload};
use crate::protocol::{current_timestamp, short_hex, DiceRoll, GameId, Hash256, PeerId};
use crate::transport::ConsensusTransport;

/// Configuration for the network consensus bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConsensusBridgeConfig {
    /// How often to broadcast the finalized state
    #[serde(with = "humantime_serde")]
    pub state_sync_interval: Duration,
    /// How often to purge timed-out operations
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Timeout for waiting on consensus
    #[serde(with = "humantime_serde")]
    pub consensus_timeout: Duration,
    /// How often randomness and dispute deadlines are checked
    #[serde(with = "humantime_serde")]
    pub deadline_check_interval: Duration,
    /// Messages older than this are dropped on receipt
    #[serde(with = "humantime_serde")]
    pub max_message_age: Duration,
    pub max_pending_operations: usize,
    /// Remembered message ids for de-duplication
    pub dedup_cache_size: usize,
    pub event_capacity: usize,
}

impl Default for NetworkConsensusBridgeConfig {
    fn default() -> Self {
        Self {
            state_sync_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            consensus_timeout: Duration::from_secs(30),
            deadline_check_interval: Duration::from_secs(1),
            max_message_age: Duration::from_secs(300),
            max_pending_operations: 100,
            dedup_cache_size: 4096,
            event_capacity: 256,
        }
    }
}

/// Notifications for the game manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusEvent {
    ProposalFinalized {
        proposal_id: ProposalId,
        operation: GameOperation,
        sequence_number: u64,
        state_hash: StateHash,
        /// Submitted through this bridge
        local: bool,
    },
    ProposalRejected {
        proposal_id: ProposalId,
        reason: String,
    },
    OperationTimedOut {
        proposal_id: ProposalId,
        operation: GameOperation,
    },
    ForkDetected {
        fork_id: StateHash,
    },
    ForkResolved {
        winner: StateHash,
        adopted: bool,
        /// Operations dropped with the losing branch, for resubmission
        orphaned_operations: Vec<GameOperation>,
    },
    StateSynced {
        from: PeerId,
        sequence_number: u64,
        state_hash: StateHash,
    },
    StateSyncRejected {
        from: PeerId,
        reason: String,
    },
    DisputeRaised {
        dispute_id: DisputeId,
        disputer: PeerId,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        expired: bool,
    },
    CompensationSubmitted {
        dispute_id: DisputeId,
        proposal_id: ProposalId,
    },
    RandomnessReady {
        round_id: RoundId,
        dice: DiceRoll,
    },
    RandomnessAborted {
        round_id: RoundId,
        reason: String,
        faulty: Vec<PeerId>,
    },
}

/// Pending operation waiting for consensus
#[derive(Debug, Clone)]
struct PendingOperation {
    operation: GameOperation,
    submitted_at: Instant,
    votes_received: usize,
    required_votes: usize,
}

/// Statistics for the network consensus bridge
#[derive(Debug, Clone)]
pub struct NetworkConsensusBridgeStats {
    pub messages_processed: u64,
    pub messages_rejected: u64,
    pub duplicates_dropped: u64,
    pub consensus_rounds_completed: u64,
    pub failed_operations: u64,
    pub state_syncs: u64,
    pub pending_operations: usize,
    pub active_participants: usize,
    pub engine: ConsensusMetrics,
}

/// Unpacked `StateSync` payload
struct SnapshotAnnouncement {
    state_hash: StateHash,
    sequence_number: u64,
    state: CompressedGameState,
    certificate: FinalityCertificate,
}

/// Work produced under the engine lock, carried out after it is released
#[derive(Default)]
struct Effects {
    outbound: Vec<ConsensusPayload>,
    events: Vec<ConsensusEvent>,
}

#[derive(Default)]
struct BridgeCounters {
    messages_processed: AtomicU64,
    messages_rejected: AtomicU64,
    duplicates_dropped: AtomicU64,
    consensus_rounds_completed: AtomicU64,
    failed_operations: AtomicU64,
    state_syncs: AtomicU64,
}

struct BridgeInner {
    engine: Mutex<ConsensusEngine>,
    keys: SigningKeyPair,
    transport: Arc<dyn ConsensusTransport>,
    config: NetworkConsensusBridgeConfig,
    game_id: GameId,
    local_peer: PeerId,
    participants: Vec<PeerId>,
    topic: String,

    pending_operations: RwLock<HashMap<ProposalId, PendingOperation>>,
    current_state: ArcSwap<GameConsensusState>,
    seen_messages: Mutex<LruCache<Hash256, ()>>,
    events: broadcast::Sender<ConsensusEvent>,
    counters: BridgeCounters,
    shutdown: watch::Sender<bool>,
}

/// Bridge connecting a local consensus engine to a transport
pub struct NetworkConsensusBridge {
    inner: Arc<BridgeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Pub/sub topic carrying one game's consensus traffic
pub fn consensus_topic(game_id: &GameId) -> String {
    format!("bitcraps/consensus/{}", hex::encode(game_id))
}

impl NetworkConsensusBridge {
    /// Create new network consensus bridge
    pub fn new(
        engine: ConsensusEngine,
        keys: SigningKeyPair,
        transport: Arc<dyn ConsensusTransport>,
        config: NetworkConsensusBridgeConfig,
    ) -> Result<Self> {
        if keys.peer_id() != engine.local_peer_id() {
            return Err(Error::Config("bridge keys do not belong to the engine's peer".to_string()));
        }
        let game_id = engine.game_id();
        let dedup_capacity = NonZeroUsize::new(config.dedup_cache_size).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let inner = BridgeInner {
            keys,
            transport,
            game_id,
            local_peer: engine.local_peer_id(),
            participants: engine.participants().to_vec(),
            topic: consensus_topic(&game_id),
            pending_operations: RwLock::new(HashMap::new()),
            current_state: ArcSwap::from_pointee(engine.get_current_state().clone()),
            seen_messages: Mutex::new(LruCache::new(dedup_capacity)),
            events,
            counters: BridgeCounters::default(),
            shutdown,
            config,
            engine: Mutex::new(engine),
        };

        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to the game topic and start the background tasks
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("bridge already started".to_string()));
        }
        let receiver = self.inner.transport.subscribe(&self.inner.topic).await?;

        log::info!(
            "Starting network consensus bridge for game {} on {} transport",
            short_hex(&self.inner.game_id),
            self.inner.transport.name()
        );

        let handles = vec![
            tokio::spawn(Self::message_processing_task(self.inner.clone(), receiver)),
            tokio::spawn(Self::state_sync_task(self.inner.clone())),
            tokio::spawn(Self::cleanup_task(self.inner.clone())),
            tokio::spawn(Self::deadline_task(self.inner.clone())),
        ];
        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Stop background tasks and wait for them to exit
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::debug!("Bridge task ended abnormally: {}", e);
            }
        }
        log::info!("Network consensus bridge for game {} stopped", short_hex(&self.inner.game_id));
    }

    /// Submit a game operation for distributed consensus. The outcome is
    /// reported through `subscribe_events`.
    pub async fn submit_operation(&self, operation: GameOperation) -> Result<ProposalId> {
        let pending = self.inner.pending_operations.read().len();
        if pending >= self.inner.config.max_pending_operations {
            return Err(Error::ResourceExhausted(format!("{} operations pending", pending)));
        }

        let (proposal_id, effects) = {
            let mut engine = self.inner.engine.lock();
            let mut effects = Effects::default();
            let proposal_id = self.inner.propose_locked(&mut engine, operation, &mut effects)?;
            self.inner.refresh_snapshot(&engine);
            (proposal_id, effects)
        };

        log::debug!("Submitted operation {} for consensus", short_hex(&proposal_id));
        self.inner.apply(effects).await?;
        Ok(proposal_id)
    }

    /// Submit the roll produced by a completed randomness round
    pub async fn submit_roll(&self, round_id: RoundId) -> Result<ProposalId> {
        let operation = self.inner.engine.lock().roll_operation(round_id)?;
        self.submit_operation(operation).await
    }

    /// Open a commit-reveal round; peers join when they see the commitment
    pub async fn start_randomness_round(&self, round_id: RoundId) -> Result<()> {
        let commit = self.inner.engine.lock().start_randomness_round(round_id)?;
        self.inner
            .apply(Effects {
                outbound: vec![ConsensusPayload::RandomnessCommit(commit)],
                events: Vec::new(),
            })
            .await
    }

    /// Raise a dispute about the current state and broadcast it
    pub async fn raise_dispute(&self, claim: DisputeClaim, evidence: Vec<DisputeEvidence>) -> Result<DisputeId> {
        let dispute = {
            let mut engine = self.inner.engine.lock();
            let dispute_id = engine.raise_dispute(claim, evidence)?;
            engine
                .get_dispute(&dispute_id)
                .cloned()
                .ok_or_else(|| Error::DisputeNotFound(short_hex(&dispute_id)))?
        };
        let dispute_id = dispute.id;
        self.inner
            .apply(Effects {
                outbound: vec![ConsensusPayload::DisputeClaim(dispute)],
                events: vec![ConsensusEvent::DisputeRaised {
                    dispute_id,
                    disputer: self.inner.local_peer,
                }],
            })
            .await?;
        Ok(dispute_id)
    }

    /// Cast and broadcast the local vote on a dispute
    pub async fn vote_on_dispute(&self, dispute_id: DisputeId, vote: DisputeVoteType, reasoning: String) -> Result<()> {
        let effects = {
            let mut engine = self.inner.engine.lock();
            let (dispute_vote, resolution) = engine.vote_on_dispute(dispute_id, vote, reasoning)?;
            let mut effects = Effects::default();
            effects.outbound.push(ConsensusPayload::DisputeVote(dispute_vote));
            if let Some(resolution) = resolution {
                self.inner.on_dispute_resolution(&mut engine, resolution, &mut effects);
            }
            self.inner.refresh_snapshot(&engine);
            effects
        };
        self.inner.apply(effects).await
    }

    /// Feed one encoded message as if it arrived from the transport
    pub async fn handle_network_message(&self, bytes: Bytes) {
        self.inner.handle_network_message(bytes).await;
    }

    /// Adopt a certified snapshot obtained out of band
    pub fn sync_state(&self, state: GameConsensusState, certificate: FinalityCertificate) -> Result<bool> {
        let mut engine = self.inner.engine.lock();
        let adopted = engine.sync_state(state, certificate)?;
        self.inner.refresh_snapshot(&engine);
        Ok(adopted)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.inner.events.subscribe()
    }

    /// Latest finalized state, without touching the engine lock
    pub fn get_current_state(&self) -> Arc<GameConsensusState> {
        self.inner.current_state.load_full()
    }

    pub fn get_pending_operations(&self) -> Vec<(ProposalId, GameOperation)> {
        self.inner
            .pending_operations
            .read()
            .iter()
            .map(|(id, op)| (*id, op.operation.clone()))
            .collect()
    }

    /// Votes seen and votes required for a locally submitted operation
    pub fn vote_progress(&self, proposal_id: &ProposalId) -> Option<(usize, usize)> {
        self.inner
            .pending_operations
            .read()
            .get(proposal_id)
            .map(|op| (op.votes_received, op.required_votes))
    }

    pub fn get_participants(&self) -> &[PeerId] {
        &self.inner.participants
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn get_stats(&self) -> NetworkConsensusBridgeStats {
        let counters = &self.inner.counters;
        let engine = self.inner.engine.lock().get_metrics().clone();
        let pending_operations = self.inner.pending_operations.read().len();
        NetworkConsensusBridgeStats {
            messages_processed: counters.messages_processed.load(Ordering::Relaxed),
            messages_rejected: counters.messages_rejected.load(Ordering::Relaxed),
            duplicates_dropped: counters.duplicates_dropped.load(Ordering::Relaxed),
            consensus_rounds_completed: counters.consensus_rounds_completed.load(Ordering::Relaxed),
            failed_operations: counters.failed_operations.load(Ordering::Relaxed),
            state_syncs: counters.state_syncs.load(Ordering::Relaxed),
            pending_operations,
            active_participants: self.inner.participants.len(),
            engine,
        }
    }

    /// Check if consensus is healthy
    pub fn is_consensus_healthy(&self) -> bool {
        let engine_healthy = self.inner.engine.lock().is_consensus_healthy();
        let pending_count = self.inner.pending_operations.read().len();
        engine_healthy && pending_count < self.inner.config.max_pending_operations
    }

    /// Inbound message loop
    async fn message_processing_task(inner: Arc<BridgeInner>, mut receiver: broadcast::Receiver<Bytes>) {
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = receiver.recv() => match received {
                    Ok(bytes) => inner.handle_network_message(bytes).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Consensus inbound lagged, {} messages lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Periodically broadcast the finalized state so lagging peers catch up
    async fn state_sync_task(inner: Arc<BridgeInner>) {
        let mut shutdown = inner.shutdown.subscribe();
        let mut ticker = interval(inner.config.state_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner.broadcast_state().await {
                        log::error!("Failed to broadcast state sync: {}", e);
                    }
                }
            }
        }
    }

    /// Periodically expire operations that did not reach consensus in time
    async fn cleanup_task(inner: Arc<BridgeInner>) {
        let mut shutdown = inner.shutdown.subscribe();
        let mut ticker = interval(inner.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let effects = inner.cleanup_expired();
                    if let Err(e) = inner.apply(effects).await {
                        log::warn!("Cleanup follow-up failed: {}", e);
                    }
                }
            }
        }
    }

    /// Randomness round and dispute deadlines
    async fn deadline_task(inner: Arc<BridgeInner>) {
        let mut shutdown = inner.shutdown.subscribe();
        let mut ticker = interval(inner.config.deadline_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let effects = inner.expire_deadlines(current_timestamp());
                    if let Err(e) = inner.apply(effects).await {
                        log::warn!("Deadline follow-up failed: {}", e);
                    }
                }
            }
        }
    }
}

impl BridgeInner {
    async fn handle_network_message(&self, bytes: Bytes) {
        let message = match ConsensusMessage::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping undecodable consensus message: {}", e);
                return;
            }
        };
        if message.game_id != self.game_id || message.sender == self.local_peer {
            return;
        }
        if let Err(e) = self.accept_envelope(&message) {
            self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping message from {}: {}", short_hex(&message.sender), e);
            return;
        }
        if self.seen_messages.lock().put(message.message_id, ()).is_some() {
            self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sender = message.sender;
        let kind = message.payload.kind();
        let result = {
            let mut engine = self.engine.lock();
            let result = self.dispatch(&mut engine, sender, message.payload);
            self.refresh_snapshot(&engine);
            result
        };

        match result {
            Ok(effects) => {
                self.counters.messages_processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.apply(effects).await {
                    log::warn!("Follow-up to {} from {} failed: {}", kind, short_hex(&sender), e);
                }
            }
            Err(e) => {
                self.counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
                match e.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::High => {
                        log::warn!("Rejected {} from {}: {}", kind, short_hex(&sender), e)
                    }
                    _ => log::debug!("Rejected {} from {}: {}", kind, short_hex(&sender), e),
                }
            }
        }
    }

    /// Envelope checks done before any payload is looked at
    fn accept_envelope(&self, message: &ConsensusMessage) -> Result<()> {
        if !self.participants.contains(&message.sender) {
            return Err(Error::UnknownPeer(short_hex(&message.sender)));
        }
        if !message.is_recent(self.config.max_message_age.as_secs(), current_timestamp()) {
            return Err(Error::Protocol(format!("stale {} message", message.payload.kind())));
        }
        message.verify()
    }

    fn dispatch(&self, engine: &mut ConsensusEngine, sender: PeerId, payload: ConsensusPayload) -> Result<Effects> {
        let mut effects = Effects::default();
        match payload {
            ConsensusPayload::Proposal(proposal) => {
                if let Some(verdict) = engine.process_proposal(proposal)? {
                    effects.outbound.push(ConsensusPayload::Vote(verdict.vote));
                    self.on_vote_outcome(verdict.proposal_id, verdict.outcome, &mut effects);
                }
            }
            ConsensusPayload::Vote(vote) => {
                let proposal_id = vote.proposal_id;
                let outcome = engine.process_peer_vote(vote)?;
                self.on_vote_outcome(proposal_id, outcome, &mut effects);
            }
            ConsensusPayload::Finalized(certificate) => match engine.process_certificate(certificate)? {
                CertificateOutcome::AlreadyApplied => {}
                CertificateOutcome::Applied(finalized) => self.on_finalized(*finalized, &mut effects),
                CertificateOutcome::Behind {
                    local_sequence,
                    remote_sequence,
                } => log::debug!(
                    "Certificate for sequence {} while at {}, waiting for state sync",
                    remote_sequence,
                    local_sequence
                ),
                CertificateOutcome::ForkDetected { fork_id } => {
                    effects.events.push(ConsensusEvent::ForkDetected { fork_id });
                }
                CertificateOutcome::ForkResolved {
                    resolution,
                    orphaned_operations,
                    superseded,
                } => {
                    effects.events.push(ConsensusEvent::ForkDetected {
                        fork_id: if resolution.adopted { resolution.winner } else { resolution.loser },
                    });
                    effects.events.push(ConsensusEvent::ForkResolved {
                        winner: resolution.winner,
                        adopted: resolution.adopted,
                        orphaned_operations,
                    });
                    self.on_superseded(superseded, &mut effects);
                }
            },
            ConsensusPayload::StateSync {
                state_hash,
                sequence_number,
                state,
                certificate,
            } => {
                let snapshot = SnapshotAnnouncement {
                    state_hash,
                    sequence_number,
                    state,
                    certificate,
                };
                self.on_state_sync(engine, sender, snapshot, &mut effects)
            }
            ConsensusPayload::RandomnessCommit(commit) => {
                let events = engine.process_randomness_commit(commit)?;
                self.on_round_events(events, &mut effects);
            }
            ConsensusPayload::RandomnessReveal(reveal) => {
                let events = engine.process_randomness_reveal(reveal)?;
                self.on_round_events(events, &mut effects);
            }
            ConsensusPayload::DisputeClaim(dispute) => {
                let dispute_id = dispute.id;
                let disputer = dispute.disputer;
                if engine.process_dispute(dispute)? {
                    log::warn!("Dispute {} raised by {}", short_hex(&dispute_id), short_hex(&disputer));
                    effects.events.push(ConsensusEvent::DisputeRaised { dispute_id, disputer });
                }
            }
            ConsensusPayload::DisputeVote(vote) => {
                if let Some(resolution) = engine.process_dispute_vote(vote)? {
                    self.on_dispute_resolution(engine, resolution, &mut effects);
                }
            }
        }
        Ok(effects)
    }

    fn on_state_sync(
        &self,
        engine: &mut ConsensusEngine,
        sender: PeerId,
        announcement: SnapshotAnnouncement,
        effects: &mut Effects,
    ) {
        let SnapshotAnnouncement {
            state_hash,
            sequence_number,
            state,
            certificate,
        } = announcement;
        if sequence_number <= engine.get_current_state().sequence_number {
            return;
        }
        let adopted = state
            .decompress()
            .and_then(|snapshot| {
                if snapshot.state_hash == state_hash {
                    Ok(snapshot)
                } else {
                    Err(Error::StateChecksumMismatch(format!(
                        "announced {} but snapshot carries {}",
                        short_hex(&state_hash),
                        short_hex(&snapshot.state_hash)
                    )))
                }
            })
            .and_then(|snapshot| engine.sync_state(snapshot, certificate));

        match adopted {
            Ok(true) => {
                self.counters.state_syncs.fetch_add(1, Ordering::Relaxed);
                effects.events.push(ConsensusEvent::StateSynced {
                    from: sender,
                    sequence_number,
                    state_hash,
                });
            }
            Ok(false) => {}
            Err(e) => {
                log::warn!("Discarded state snapshot from {}: {}", short_hex(&sender), e);
                effects.events.push(ConsensusEvent::StateSyncRejected {
                    from: sender,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Propose under the engine lock and track the result as pending
    fn propose_locked(&self, engine: &mut ConsensusEngine, operation: GameOperation, effects: &mut Effects) -> Result<ProposalId> {
        let (proposal, verdict) = engine.propose(operation.clone())?;
        let proposal_id = proposal.id;
        let votes_received = match &verdict.outcome {
            VoteOutcome::Pending { votes_for, .. } => *votes_for,
            _ => 1,
        };
        self.pending_operations.write().insert(
            proposal_id,
            PendingOperation {
                operation,
                submitted_at: Instant::now(),
                votes_received,
                required_votes: byzantine_threshold(self.participants.len()),
            },
        );
        effects.outbound.push(ConsensusPayload::Proposal(proposal));
        effects.outbound.push(ConsensusPayload::Vote(verdict.vote));
        self.on_vote_outcome(proposal_id, verdict.outcome, effects);
        Ok(proposal_id)
    }

    fn on_vote_outcome(&self, proposal_id: ProposalId, outcome: VoteOutcome, effects: &mut Effects) {
        match outcome {
            VoteOutcome::Pending { votes_for, .. } => {
                if let Some(pending) = self.pending_operations.write().get_mut(&proposal_id) {
                    pending.votes_received = votes_for;
                }
            }
            VoteOutcome::Finalized(finalized) => self.on_finalized(*finalized, effects),
            VoteOutcome::Rejected { proposal_id, reason } => {
                if self.pending_operations.write().remove(&proposal_id).is_some() {
                    self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
                }
                effects.events.push(ConsensusEvent::ProposalRejected { proposal_id, reason });
            }
            VoteOutcome::Buffered | VoteOutcome::Stale => {}
        }
    }

    fn on_finalized(&self, finalized: FinalizedProposal, effects: &mut Effects) {
        let FinalizedProposal {
            proposal_id,
            proposer,
            operation,
            state,
            certificate,
            superseded,
        } = finalized;

        let local = self.pending_operations.write().remove(&proposal_id).is_some();
        if local {
            self.counters.consensus_rounds_completed.fetch_add(1, Ordering::Relaxed);
        }
        // Only the proposer spreads the certificate
        if proposer == self.local_peer {
            effects.outbound.push(ConsensusPayload::Finalized(certificate));
        }
        effects.events.push(ConsensusEvent::ProposalFinalized {
            proposal_id,
            operation,
            sequence_number: state.sequence_number,
            state_hash: state.state_hash,
            local,
        });
        self.on_superseded(superseded, effects);
    }

    fn on_superseded(&self, superseded: Vec<ProposalId>, effects: &mut Effects) {
        let mut pending = self.pending_operations.write();
        for proposal_id in superseded {
            if pending.remove(&proposal_id).is_some() {
                self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
                effects.events.push(ConsensusEvent::ProposalRejected {
                    proposal_id,
                    reason: "superseded by a newer state".to_string(),
                });
            }
        }
    }

    fn on_round_events(&self, events: Vec<RoundEvent>, effects: &mut Effects) {
        for event in events {
            match event {
                RoundEvent::Commit(commit) => effects.outbound.push(ConsensusPayload::RandomnessCommit(commit)),
                RoundEvent::Reveal(reveal) => effects.outbound.push(ConsensusPayload::RandomnessReveal(reveal)),
                RoundEvent::Completed(outcome) => effects.events.push(ConsensusEvent::RandomnessReady {
                    round_id: outcome.round_id,
                    dice: outcome.dice,
                }),
                RoundEvent::Aborted {
                    round_id,
                    reason,
                    faulty,
                } => effects.events.push(ConsensusEvent::RandomnessAborted {
                    round_id,
                    reason,
                    faulty,
                }),
            }
        }
    }

    /// Report a resolution; the disputer submits the compensation if upheld
    fn on_dispute_resolution(&self, engine: &mut ConsensusEngine, resolution: DisputeResolution, effects: &mut Effects) {
        let DisputeResolution {
            dispute_id,
            disputer,
            outcome,
            compensation,
            expired,
        } = resolution;
        effects.events.push(ConsensusEvent::DisputeResolved {
            dispute_id,
            outcome,
            expired,
        });

        if outcome != DisputeOutcome::Upheld || disputer != self.local_peer {
            return;
        }
        let Some(operation) = compensation else {
            return;
        };
        match self.propose_locked(engine, operation, effects) {
            Ok(proposal_id) => {
                log::info!(
                    "Submitted compensation {} for dispute {}",
                    short_hex(&proposal_id),
                    short_hex(&dispute_id)
                );
                effects.events.push(ConsensusEvent::CompensationSubmitted {
                    dispute_id,
                    proposal_id,
                });
            }
            Err(e) => log::warn!("Compensation for dispute {} failed: {}", short_hex(&dispute_id), e),
        }
    }

    /// Purge timed-out local operations and anything the engine already dropped
    fn cleanup_expired(&self) -> Effects {
        let mut effects = Effects::default();
        let timeout = self.config.consensus_timeout;

        let mut engine = self.engine.lock();
        let mut pending = self.pending_operations.write();

        let overdue: Vec<ProposalId> = pending
            .iter()
            .filter(|(_, op)| op.submitted_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for proposal_id in overdue {
            // A proposal decided before the lock was taken keeps its outcome
            if !engine.expire_proposal(&proposal_id) {
                continue;
            }
            let Some(op) = pending.remove(&proposal_id) else {
                continue;
            };
            self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
            let error = Error::consensus_timeout(short_hex(&proposal_id), timeout.as_millis());
            log::warn!("{}", error);
            effects.events.push(ConsensusEvent::OperationTimedOut {
                proposal_id,
                operation: op.operation,
            });
        }

        let expired_remote = engine.expire_stale_proposals();
        if !expired_remote.is_empty() {
            log::debug!("Expired {} stale peer proposal(s)", expired_remote.len());
        }

        // Local operations the engine decided outside the vote path, e.g. after a state sync
        let untracked: Vec<ProposalId> = pending
            .keys()
            .filter(|id| engine.get_proposal(id).is_none())
            .copied()
            .collect();
        for proposal_id in untracked {
            pending.remove(&proposal_id);
            if engine.proposal_status(&proposal_id) == Some(ProposalStatus::Finalized) {
                continue;
            }
            self.counters.failed_operations.fetch_add(1, Ordering::Relaxed);
            effects.events.push(ConsensusEvent::ProposalRejected {
                proposal_id,
                reason: "dropped by the consensus engine".to_string(),
            });
        }
        drop(pending);

        self.refresh_snapshot(&engine);
        effects
    }

    fn expire_deadlines(&self, now: u64) -> Effects {
        let mut effects = Effects::default();
        let mut engine = self.engine.lock();
        let round_events = engine.expire_randomness_at(now);
        self.on_round_events(round_events, &mut effects);
        for resolution in engine.expire_disputes_at(now) {
            self.on_dispute_resolution(&mut engine, resolution, &mut effects);
        }
        self.refresh_snapshot(&engine);
        effects
    }

    async fn broadcast_state(&self) -> Result<()> {
        let (snapshot, certificate) = {
            let engine = self.engine.lock();
            match engine.latest_certificate() {
                Some(certificate) => (engine.get_current_state().clone(), certificate.clone()),
                // Genesis is shared by construction
                None => return Ok(()),
            }
        };
        let state = CompressedGameState::compress(&snapshot)?;
        self.publish(ConsensusPayload::StateSync {
            state_hash: snapshot.state_hash,
            sequence_number: snapshot.sequence_number,
            state,
            certificate,
        })
        .await?;
        log::debug!("Broadcasted state sync for sequence {}", snapshot.sequence_number);
        Ok(())
    }

    fn refresh_snapshot(&self, engine: &ConsensusEngine) {
        let current = engine.get_current_state();
        if self.current_state.load().state_hash != current.state_hash {
            self.current_state.store(Arc::new(current.clone()));
        }
    }

    async fn publish(&self, payload: ConsensusPayload) -> Result<()> {
        let message = ConsensusMessage::new(&self.keys, self.game_id, payload)?;
        self.transport.broadcast(&self.topic, message.encode()?).await
    }

    /// Publish outbound messages, then notify subscribers
    async fn apply(&self, effects: Effects) -> Result<()> {
        let mut first_error = None;
        for payload in effects.outbound {
            let kind = payload.kind();
            if let Err(e) = self.publish(payload).await {
                log::warn!("Failed to broadcast {}: {}", kind, e);
                first_error.get_or_insert(e);
            }
        }
        for event in effects.events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
