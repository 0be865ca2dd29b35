//! Commit-reveal scheme for fair randomness generation
//!
//! Every participant commits to `SHA256(round_id || value)` before anyone
//! reveals, so no single peer can steer the dice after seeing the others'
//! contributions. Valid revealed values are XOR-combined, hashed into a seed,
//! and reduced to two dice by rejection sampling.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use crate::crypto::{hash_parts, random_bytes32, verify_signature, SigningKeyPair};
use crate::error::{Error, Result};
use crate::protocol::{short_hex, DiceRoll, Hash256, PeerId, Signature};

use super::{byzantine_threshold, RoundId};

pub const COMMIT_REVEAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest byte value accepted by rejection sampling (252 = 42 * 6)
const DIE_SAMPLE_LIMIT: u8 = 252;

/// Randomness round configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomnessConfig {
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reveal_timeout: Duration,
    /// Finished rounds kept for proposal validation
    pub retained_rounds: usize,
}

impl Default for RandomnessConfig {
    fn default() -> Self {
        Self {
            commit_timeout: COMMIT_REVEAL_TIMEOUT,
            reveal_timeout: COMMIT_REVEAL_TIMEOUT,
            retained_rounds: 32,
        }
    }
}

/// Randomness commitment for dice rolls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessCommit {
    pub player: PeerId,
    pub round_id: RoundId,
    pub commitment: Hash256, // SHA256(round_id || value)
    pub timestamp: u64,
    pub signature: Signature,
}

/// Randomness reveal for dice rolls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessReveal {
    pub player: PeerId,
    pub round_id: RoundId,
    pub value: [u8; 32],
    pub timestamp: u64,
    pub signature: Signature,
}

impl RandomnessCommit {
    pub fn new(keys: &SigningKeyPair, round_id: RoundId, value: &[u8; 32], timestamp: u64) -> Self {
        let player = keys.peer_id();
        let commitment = Self::create_commitment(round_id, value);
        let signature = keys.sign(&Self::signing_payload(&player, round_id, &commitment));
        Self {
            player,
            round_id,
            commitment,
            timestamp,
            signature,
        }
    }

    /// Create commitment hash
    pub fn create_commitment(round_id: RoundId, value: &[u8; 32]) -> Hash256 {
        hash_parts(b"", &[&round_id.to_le_bytes(), value])
    }

    fn signing_payload(player: &PeerId, round_id: RoundId, commitment: &Hash256) -> Hash256 {
        hash_parts(b"BITCRAPS_COMMIT", &[player, &round_id.to_le_bytes(), commitment])
    }

    pub fn verify_signature(&self) -> bool {
        verify_signature(
            &self.player,
            &Self::signing_payload(&self.player, self.round_id, &self.commitment),
            &self.signature,
        )
    }

    /// Verify commitment against reveal
    pub fn verify_reveal(&self, reveal: &RandomnessReveal) -> bool {
        self.player == reveal.player
            && self.round_id == reveal.round_id
            && self.commitment == Self::create_commitment(reveal.round_id, &reveal.value)
    }
}

impl RandomnessReveal {
    pub fn new(keys: &SigningKeyPair, round_id: RoundId, value: [u8; 32], timestamp: u64) -> Self {
        let player = keys.peer_id();
        let signature = keys.sign(&Self::signing_payload(&player, round_id, &value));
        Self {
            player,
            round_id,
            value,
            timestamp,
            signature,
        }
    }

    fn signing_payload(player: &PeerId, round_id: RoundId, value: &[u8; 32]) -> Hash256 {
        hash_parts(b"BITCRAPS_REVEAL", &[player, &round_id.to_le_bytes(), value])
    }

    pub fn verify_signature(&self) -> bool {
        verify_signature(
            &self.player,
            &Self::signing_payload(&self.player, self.round_id, &self.value),
            &self.signature,
        )
    }
}

/// Entropy pool for one round
///
/// Contributions are XOR-combined, so the result is independent of arrival
/// order and stays unpredictable while any one contributor is honest.
#[derive(Debug, Clone, Default)]
pub struct EntropyPool {
    combined: [u8; 32],
    sources: usize,
}

impl EntropyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entropy from a participant
    pub fn add_entropy(&mut self, entropy: &[u8; 32]) {
        for (acc, byte) in self.combined.iter_mut().zip(entropy.iter()) {
            *acc ^= byte;
        }
        self.sources += 1;
    }

    /// Get number of entropy sources
    pub fn entropy_count(&self) -> usize {
        self.sources
    }

    /// Check if enough entropy is collected
    pub fn has_sufficient_entropy(&self, min_sources: usize) -> bool {
        self.sources >= min_sources
    }

    /// Round-bound seed: `SHA256("BITCRAPS_DICE" || round_id || xor)`
    pub fn seed(&self, round_id: RoundId) -> Hash256 {
        hash_parts(b"BITCRAPS_DICE", &[&round_id.to_le_bytes(), &self.combined])
    }

    /// Generate a dice roll from the seed using unbiased rejection sampling
    pub fn generate_dice_roll(&self, round_id: RoundId) -> DiceRoll {
        let mut pool = self.seed(round_id);
        let mut cursor = 0usize;
        let mut dice = [0u8; 2];
        let mut drawn = 0usize;

        while drawn < dice.len() {
            if cursor == pool.len() {
                // Seed exhausted, re-hash to get new randomness
                pool = hash_parts(b"DICE_REROLL", &[&pool]);
                cursor = 0;
            }
            let byte = pool[cursor];
            cursor += 1;
            if byte < DIE_SAMPLE_LIMIT {
                dice[drawn] = byte % 6 + 1;
                drawn += 1;
            }
        }

        DiceRoll {
            die1: dice[0],
            die2: dice[1],
        }
    }
}

/// Dice produced by a completed round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceOutcome {
    pub round_id: RoundId,
    pub dice: DiceRoll,
    /// Commitments of the contributing participants, sorted
    pub entropy_proof: Vec<Hash256>,
    pub contributors: Vec<PeerId>,
}

/// Something a round produced that the caller must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    /// Local commitment to broadcast
    Commit(RandomnessCommit),
    /// Local reveal to broadcast
    Reveal(RandomnessReveal),
    Completed(DiceOutcome),
    Aborted {
        round_id: RoundId,
        reason: String,
        faulty: Vec<PeerId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoundPhase {
    Committing,
    Revealing,
    Completed(DiceOutcome),
    Aborted,
}

#[derive(Debug, Clone)]
struct RandomnessRound {
    round_id: RoundId,
    phase: RoundPhase,
    commit_deadline: u64,
    reveal_deadline: u64,
    commits: BTreeMap<PeerId, RandomnessCommit>,
    reveals: BTreeMap<PeerId, RandomnessReveal>,
    local_value: [u8; 32],
    faulty: BTreeSet<PeerId>,
}

impl RandomnessRound {
    fn is_finished(&self) -> bool {
        matches!(self.phase, RoundPhase::Completed(_) | RoundPhase::Aborted)
    }
}

/// Runs commit-reveal rounds for one session
pub struct RandomnessCoordinator {
    config: RandomnessConfig,
    local_peer: PeerId,
    participants: Vec<PeerId>,
    rounds: BTreeMap<RoundId, RandomnessRound>,
    used_round_ids: HashSet<RoundId>,
}

impl RandomnessCoordinator {
    pub fn new(local_peer: PeerId, participants: Vec<PeerId>, config: RandomnessConfig) -> Self {
        Self {
            config,
            local_peer,
            participants,
            rounds: BTreeMap::new(),
            used_round_ids: HashSet::new(),
        }
    }

    /// Start a round locally and return the commitment to broadcast
    pub fn begin_round(&mut self, round_id: RoundId, now: u64, keys: &SigningKeyPair) -> Result<RandomnessCommit> {
        if !self.used_round_ids.insert(round_id) {
            return Err(Error::Randomness(format!("Round {} was already used", round_id)));
        }
        let value = random_bytes32();
        let commit = RandomnessCommit::new(keys, round_id, &value, now);

        let mut commits = BTreeMap::new();
        commits.insert(self.local_peer, commit.clone());
        let commit_deadline = now + self.config.commit_timeout.as_secs();
        self.rounds.insert(
            round_id,
            RandomnessRound {
                round_id,
                phase: RoundPhase::Committing,
                commit_deadline,
                reveal_deadline: commit_deadline + self.config.reveal_timeout.as_secs(),
                commits,
                reveals: BTreeMap::new(),
                local_value: value,
                faulty: BTreeSet::new(),
            },
        );
        log::debug!("Started randomness round {}", round_id);
        Ok(commit)
    }

    /// Accept a peer's commitment. Joins the round on first sight.
    pub fn add_commit(
        &mut self,
        commit: RandomnessCommit,
        now: u64,
        keys: &SigningKeyPair,
    ) -> Result<Vec<RoundEvent>> {
        self.check_participant(&commit.player)?;
        if !commit.verify_signature() {
            return Err(Error::InvalidSignature(format!(
                "commitment from {} for round {}",
                short_hex(&commit.player),
                commit.round_id
            )));
        }

        let mut events = Vec::new();
        if !self.rounds.contains_key(&commit.round_id) {
            if self.used_round_ids.contains(&commit.round_id) {
                return Err(Error::Randomness(format!(
                    "Round {} is closed",
                    commit.round_id
                )));
            }
            let local = self.begin_round(commit.round_id, now, keys)?;
            events.push(RoundEvent::Commit(local));
        }

        let expected = self.participants.len();
        let round = self
            .rounds
            .get_mut(&commit.round_id)
            .ok_or_else(|| Error::Randomness(format!("Round {} vanished", commit.round_id)))?;

        if round.phase != RoundPhase::Committing {
            return Err(Error::Randomness(format!(
                "Commit for round {} arrived after the commit phase",
                round.round_id
            )));
        }
        if now > round.commit_deadline {
            return Err(Error::Randomness(format!(
                "Commit for round {} arrived after the deadline",
                round.round_id
            )));
        }
        if let Some(existing) = round.commits.get(&commit.player) {
            if existing.commitment != commit.commitment {
                round.faulty.insert(commit.player);
                return Err(Error::Randomness(format!(
                    "{} sent two different commitments for round {}",
                    short_hex(&commit.player),
                    round.round_id
                )));
            }
            return Ok(events);
        }
        round.commits.insert(commit.player, commit);

        if round.commits.len() == expected {
            events.extend(Self::open_reveal_phase(round, keys, now));
            events.extend(Self::try_complete(round, expected, false));
        }
        Ok(events)
    }

    /// Accept a peer's reveal
    pub fn add_reveal(&mut self, reveal: RandomnessReveal) -> Result<Vec<RoundEvent>> {
        self.check_participant(&reveal.player)?;
        if !reveal.verify_signature() {
            return Err(Error::InvalidSignature(format!(
                "reveal from {} for round {}",
                short_hex(&reveal.player),
                reveal.round_id
            )));
        }

        let expected = self.participants.len();
        let round = self
            .rounds
            .get_mut(&reveal.round_id)
            .ok_or_else(|| Error::Randomness(format!("Unknown round {}", reveal.round_id)))?;
        if round.is_finished() {
            return Err(Error::Randomness(format!("Round {} is closed", round.round_id)));
        }
        if round.faulty.contains(&reveal.player) {
            return Err(Error::InvalidReveal(format!(
                "{} is excluded from round {}",
                short_hex(&reveal.player),
                round.round_id
            )));
        }
        if round.reveals.contains_key(&reveal.player) {
            return Ok(Vec::new());
        }
        let commit = round.commits.get(&reveal.player).ok_or_else(|| {
            Error::InvalidReveal(format!(
                "{} revealed without committing to round {}",
                short_hex(&reveal.player),
                round.round_id
            ))
        })?;
        if !commit.verify_reveal(&reveal) {
            round.faulty.insert(reveal.player);
            log::warn!(
                "Reveal from {} does not match its commitment in round {}",
                short_hex(&reveal.player),
                round.round_id
            );
            return Err(Error::InvalidReveal(format!(
                "value from {} does not hash to its commitment",
                short_hex(&reveal.player)
            )));
        }
        round.reveals.insert(reveal.player, reveal);

        Ok(Self::try_complete(round, expected, false).into_iter().collect())
    }

    /// Close rounds whose commit or reveal deadline has passed
    pub fn expire_at(&mut self, now: u64, keys: &SigningKeyPair) -> Vec<RoundEvent> {
        let expected = self.participants.len();
        let mut events = Vec::new();
        for round in self.rounds.values_mut() {
            match round.phase {
                RoundPhase::Committing if now > round.commit_deadline => {
                    if round.commits.len() >= byzantine_threshold(expected) {
                        events.extend(Self::open_reveal_phase(round, keys, now));
                        events.extend(Self::try_complete(round, expected, false));
                    } else {
                        events.push(Self::abort(
                            round,
                            format!(
                                "only {} of {} commitments before the deadline",
                                round.commits.len(),
                                expected
                            ),
                        ));
                    }
                }
                RoundPhase::Revealing if now > round.reveal_deadline => {
                    let missing: Vec<PeerId> = round
                        .commits
                        .keys()
                        .filter(|peer| !round.reveals.contains_key(*peer))
                        .copied()
                        .collect();
                    for peer in missing {
                        log::warn!(
                            "{} never revealed in round {}",
                            short_hex(&peer),
                            round.round_id
                        );
                        round.faulty.insert(peer);
                    }
                    events.extend(Self::try_complete(round, expected, true));
                }
                _ => {}
            }
        }
        self.prune();
        events
    }

    /// Outcome of a completed round
    pub fn outcome(&self, round_id: RoundId) -> Option<&DiceOutcome> {
        match self.rounds.get(&round_id).map(|round| &round.phase) {
            Some(RoundPhase::Completed(outcome)) => Some(outcome),
            _ => None,
        }
    }

    /// Participants flagged in a round for bad or missing reveals
    pub fn faulty_participants(&self, round_id: RoundId) -> Vec<PeerId> {
        self.rounds
            .get(&round_id)
            .map(|round| round.faulty.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, round_id: RoundId) -> bool {
        self.rounds
            .get(&round_id)
            .is_some_and(|round| !round.is_finished())
    }

    pub fn active_rounds(&self) -> usize {
        self.rounds.values().filter(|round| !round.is_finished()).count()
    }

    fn check_participant(&self, peer: &PeerId) -> Result<()> {
        if self.participants.contains(peer) {
            Ok(())
        } else {
            Err(Error::UnknownPeer(short_hex(peer)))
        }
    }

    fn open_reveal_phase(round: &mut RandomnessRound, keys: &SigningKeyPair, now: u64) -> Option<RoundEvent> {
        round.phase = RoundPhase::Revealing;
        let local_peer = keys.peer_id();
        if !round.commits.contains_key(&local_peer) {
            return None;
        }
        let reveal = RandomnessReveal::new(keys, round.round_id, round.local_value, now);
        round.reveals.insert(local_peer, reveal.clone());
        Some(RoundEvent::Reveal(reveal))
    }

    /// Finish the round once every committer revealed, or at the deadline
    fn try_complete(round: &mut RandomnessRound, expected: usize, deadline_passed: bool) -> Option<RoundEvent> {
        if round.phase != RoundPhase::Revealing {
            return None;
        }
        let outstanding = round
            .commits
            .keys()
            .filter(|peer| !round.faulty.contains(*peer) && !round.reveals.contains_key(*peer))
            .count();
        if !deadline_passed && outstanding > 0 {
            return None;
        }

        // Flagged participants never contribute, whatever they sent
        let valid: Vec<&RandomnessReveal> = round
            .reveals
            .values()
            .filter(|reveal| !round.faulty.contains(&reveal.player))
            .collect();

        let required = byzantine_threshold(expected);
        if valid.len() < required {
            let reason = format!("{} valid contributions, {} required", valid.len(), required);
            return Some(Self::abort(round, reason));
        }

        let mut pool = EntropyPool::new();
        let mut entropy_proof = Vec::with_capacity(valid.len());
        let mut contributors = Vec::with_capacity(valid.len());
        for reveal in valid {
            pool.add_entropy(&reveal.value);
            contributors.push(reveal.player);
            if let Some(commit) = round.commits.get(&reveal.player) {
                entropy_proof.push(commit.commitment);
            }
        }
        entropy_proof.sort_unstable();

        let outcome = DiceOutcome {
            round_id: round.round_id,
            dice: pool.generate_dice_roll(round.round_id),
            entropy_proof,
            contributors,
        };
        log::info!(
            "Randomness round {} completed: {}+{} from {} contributors",
            round.round_id,
            outcome.dice.die1,
            outcome.dice.die2,
            outcome.contributors.len()
        );
        round.phase = RoundPhase::Completed(outcome.clone());
        Some(RoundEvent::Completed(outcome))
    }

    fn abort(round: &mut RandomnessRound, reason: String) -> RoundEvent {
        log::warn!("Randomness round {} aborted: {}", round.round_id, reason);
        round.phase = RoundPhase::Aborted;
        RoundEvent::Aborted {
            round_id: round.round_id,
            reason,
            faulty: round.faulty.iter().copied().collect(),
        }
    }

    fn prune(&mut self) {
        let finished: Vec<RoundId> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.is_finished())
            .map(|(id, _)| *id)
            .collect();
        let excess = finished.len().saturating_sub(self.config.retained_rounds);
        for id in finished.into_iter().take(excess) {
            self.rounds.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinators(n: usize) -> Vec<(SigningKeyPair, RandomnessCoordinator)> {
        let keys: Vec<SigningKeyPair> = (0..n).map(|_| SigningKeyPair::generate()).collect();
        let participants: Vec<PeerId> = keys.iter().map(|k| k.peer_id()).collect();
        keys.into_iter()
            .map(|k| {
                let coordinator =
                    RandomnessCoordinator::new(k.peer_id(), participants.clone(), RandomnessConfig::default());
                (k, coordinator)
            })
            .collect()
    }

    use std::collections::VecDeque;

    #[test]
    fn test_commitment_binding() {
        let keys = SigningKeyPair::generate();
        let value = [3u8; 32];
        let commit = RandomnessCommit::new(&keys, 7, &value, 0);
        assert!(commit.verify_signature());

        let reveal = RandomnessReveal::new(&keys, 7, value, 0);
        assert!(commit.verify_reveal(&reveal));

        let mut forged = RandomnessReveal::new(&keys, 7, [4u8; 32], 0);
        assert!(!commit.verify_reveal(&forged));
        forged.value = value;
        // Value swapped back, but signature no longer covers it
        assert!(!forged.verify_signature());
    }

    #[test]
    fn test_entropy_pool_order_independent() {
        let mut a = EntropyPool::new();
        a.add_entropy(&[1u8; 32]);
        a.add_entropy(&[2u8; 32]);
        let mut b = EntropyPool::new();
        b.add_entropy(&[2u8; 32]);
        b.add_entropy(&[1u8; 32]);
        assert_eq!(a.generate_dice_roll(9), b.generate_dice_roll(9));
        assert_ne!(a.seed(9), a.seed(10));
    }

    #[test]
    fn test_dice_always_in_range() {
        for i in 0..200u64 {
            let mut pool = EntropyPool::new();
            pool.add_entropy(&hash_parts(b"t", &[&i.to_le_bytes()]));
            let roll = pool.generate_dice_roll(i);
            assert!((1..=6).contains(&roll.die1));
            assert!((1..=6).contains(&roll.die2));
        }
    }

    #[test]
    fn test_full_round_agrees() {
        let mut peers = coordinators(4);
        let now = 1_000;

        let (first_keys, first) = &mut peers[0];
        let opening = first.begin_round(1, now, first_keys).unwrap();

        // Deliver every broadcast to every other peer until quiet
        let mut outbox = VecDeque::from([RoundEvent::Commit(opening)]);
        let mut outcomes = Vec::new();
        while let Some(event) = outbox.pop_front() {
            let sender = match &event {
                RoundEvent::Commit(c) => c.player,
                RoundEvent::Reveal(r) => r.player,
                RoundEvent::Completed(o) => {
                    outcomes.push(o.clone());
                    continue;
                }
                RoundEvent::Aborted { .. } => panic!("round aborted"),
            };
            for (keys, coordinator) in peers.iter_mut() {
                if keys.peer_id() == sender {
                    continue;
                }
                let produced = match &event {
                    RoundEvent::Commit(c) => coordinator.add_commit(c.clone(), now, keys).unwrap(),
                    RoundEvent::Reveal(r) => coordinator.add_reveal(r.clone()).unwrap(),
                    _ => Vec::new(),
                };
                outbox.extend(produced);
            }
        }

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o == &outcomes[0]));
        assert_eq!(outcomes[0].contributors.len(), 4);
        assert_eq!(outcomes[0].entropy_proof.len(), 4);
        assert!(peers.iter().all(|(_, c)| c.outcome(1) == Some(&outcomes[0])));
    }

    #[test]
    fn test_round_ids_never_reused() {
        let mut peers = coordinators(4);
        let (keys, coordinator) = &mut peers[0];
        coordinator.begin_round(5, 0, keys).unwrap();
        assert!(coordinator.begin_round(5, 0, keys).is_err());
    }

    #[test]
    fn test_mismatched_reveal_is_flagged() {
        let mut peers = coordinators(4);
        let now = 0;
        let commits: Vec<RandomnessCommit> = {
            let (k0, c0) = &mut peers[0];
            let first = c0.begin_round(1, now, k0).unwrap();
            let mut all = vec![first.clone()];
            for (k, c) in peers.iter_mut().skip(1) {
                let events = c.add_commit(first.clone(), now, k).unwrap();
                for event in events {
                    if let RoundEvent::Commit(commit) = event {
                        all.push(commit);
                    }
                }
            }
            all
        };
        let (k0, c0) = &mut peers[0];
        for commit in commits.iter().skip(1) {
            c0.add_commit(commit.clone(), now, k0).unwrap();
        }

        let liar = peers[1].0.peer_id();
        let bogus = RandomnessReveal::new(&peers[1].0, 1, [0xAB; 32], now);
        let (_, c0) = &mut peers[0];
        let err = c0.add_reveal(bogus).unwrap_err();
        assert!(matches!(err, Error::InvalidReveal(_)));
        assert_eq!(c0.faulty_participants(1), vec![liar]);
    }

    /// Peer 0's coordinator with every commitment in; peer `i` committed to `[i; 32]`
    fn committed_round(n: usize) -> (Vec<SigningKeyPair>, RandomnessCoordinator) {
        let keys: Vec<SigningKeyPair> = (0..n).map(|_| SigningKeyPair::generate()).collect();
        let participants: Vec<PeerId> = keys.iter().map(|k| k.peer_id()).collect();
        let mut coordinator = RandomnessCoordinator::new(keys[0].peer_id(), participants, RandomnessConfig::default());
        coordinator.begin_round(1, 0, &keys[0]).unwrap();
        for (i, k) in keys.iter().enumerate().skip(1) {
            let commit = RandomnessCommit::new(k, 1, &[i as u8; 32], 0);
            coordinator.add_commit(commit, 0, &keys[0]).unwrap();
        }
        (keys, coordinator)
    }

    fn reveal(keys: &[SigningKeyPair], i: usize) -> RandomnessReveal {
        RandomnessReveal::new(&keys[i], 1, [i as u8; 32], 1)
    }

    fn reveal_deadline() -> u64 {
        COMMIT_REVEAL_TIMEOUT.as_secs() * 2
    }

    #[test]
    fn test_flagged_peer_cannot_reveal_again() {
        let (keys, mut coordinator) = committed_round(4);
        let cheat = keys[1].peer_id();

        let bogus = RandomnessReveal::new(&keys[1], 1, [0xAB; 32], 1);
        assert!(matches!(coordinator.add_reveal(bogus), Err(Error::InvalidReveal(_))));
        // The honest value is refused once the commitment was broken
        assert!(matches!(coordinator.add_reveal(reveal(&keys, 1)), Err(Error::InvalidReveal(_))));

        assert!(coordinator.add_reveal(reveal(&keys, 2)).unwrap().is_empty());
        let events = coordinator.add_reveal(reveal(&keys, 3)).unwrap();
        let [RoundEvent::Completed(outcome)] = events.as_slice() else {
            panic!("round should complete without the flagged peer: {:?}", events);
        };
        assert_eq!(outcome.contributors.len(), 3);
        assert!(!outcome.contributors.contains(&cheat));
        assert_eq!(outcome.entropy_proof.len(), 3);
        assert_eq!(coordinator.faulty_participants(1), vec![cheat]);
    }

    #[test]
    fn test_reveal_deadline_completes_without_silent_peer() {
        let (keys, mut coordinator) = committed_round(4);
        coordinator.add_reveal(reveal(&keys, 2)).unwrap();
        coordinator.add_reveal(reveal(&keys, 3)).unwrap();
        assert!(coordinator.is_active(1));

        assert!(coordinator.expire_at(reveal_deadline(), &keys[0]).is_empty());
        let events = coordinator.expire_at(reveal_deadline() + 1, &keys[0]);
        let [RoundEvent::Completed(outcome)] = events.as_slice() else {
            panic!("round should complete at the reveal deadline: {:?}", events);
        };
        let silent = keys[1].peer_id();
        assert_eq!(outcome.contributors.len(), 3);
        assert!(!outcome.contributors.contains(&silent));
        assert_eq!(coordinator.faulty_participants(1), vec![silent]);
        assert_eq!(coordinator.outcome(1), Some(outcome));
    }

    #[test]
    fn test_reveal_deadline_aborts_below_threshold() {
        let (keys, mut coordinator) = committed_round(4);
        coordinator.add_reveal(reveal(&keys, 2)).unwrap();

        let events = coordinator.expire_at(reveal_deadline() + 1, &keys[0]);
        let [RoundEvent::Aborted { round_id: 1, faulty, .. }] = events.as_slice() else {
            panic!("round should abort with two contributions: {:?}", events);
        };
        let mut expected = vec![keys[1].peer_id(), keys[3].peer_id()];
        expected.sort();
        let mut flagged = faulty.clone();
        flagged.sort();
        assert_eq!(flagged, expected);
        assert_eq!(coordinator.faulty_participants(1).len(), 2);
        assert!(coordinator.outcome(1).is_none());
        assert!(!coordinator.is_active(1));
    }

    #[test]
    fn test_commit_deadline_aborts_thin_round() {
        let mut peers = coordinators(4);
        let (keys, coordinator) = &mut peers[0];
        coordinator.begin_round(1, 0, keys).unwrap();

        let events = coordinator.expire_at(COMMIT_REVEAL_TIMEOUT.as_secs() + 1, keys);
        assert!(matches!(events.as_slice(), [RoundEvent::Aborted { round_id: 1, .. }]));
        assert!(!coordinator.is_active(1));
        assert!(coordinator.outcome(1).is_none());
    }
}
