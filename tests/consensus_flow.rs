//! Multi-peer consensus flows driven directly against engines, with the test
//! acting as the network.

use std::collections::VecDeque;

use bitcraps_consensus::protocol::consensus::{
    CertificateOutcome, ConsensusConfig, ConsensusEngine, DisputeClaim, DisputeOutcome, FinalityCertificate,
    GameOperation, GameProposal, GameSession, ProposalStatus, RoundEvent, SignedVote, VoteChoice, VoteOutcome,
};
use bitcraps_consensus::protocol::{current_timestamp, BetType, CrapTokens, PeerId, TREASURY_ADDRESS};
use bitcraps_consensus::{Error, GamePhase, SigningKeyPair};

fn setup(n: usize) -> (Vec<SigningKeyPair>, Vec<ConsensusEngine>) {
    let keys: Vec<SigningKeyPair> = (0..n).map(|_| SigningKeyPair::generate()).collect();
    let session = GameSession::new([3; 16], keys.iter().map(|k| k.peer_id()).collect(), 1_700_000_000).unwrap();
    let engines = keys
        .iter()
        .map(|k| ConsensusEngine::new(session.clone(), k.clone(), ConsensusConfig::default()).unwrap())
        .collect();
    (keys, engines)
}

fn bet(player: PeerId, amount: u64) -> GameOperation {
    GameOperation::PlaceBet {
        player,
        bet_type: BetType::Pass,
        amount: CrapTokens::new(amount),
    }
}

/// Propose on `proposer`, let every other engine vote, then deliver all votes
/// everywhere. Returns the proposal id.
fn run_proposal(engines: &mut [ConsensusEngine], proposer: usize, operation: GameOperation) -> [u8; 32] {
    let (proposal, verdict) = engines[proposer].propose(operation).unwrap();
    let mut votes = vec![verdict.vote];
    for (i, engine) in engines.iter_mut().enumerate() {
        if i != proposer {
            let verdict = engine.process_proposal(proposal.clone()).unwrap().unwrap();
            votes.push(verdict.vote);
        }
    }
    for engine in engines.iter_mut() {
        let me = engine.local_peer_id();
        for vote in votes.iter().filter(|v| v.voter != me) {
            engine.process_peer_vote(vote.clone()).unwrap();
        }
    }
    proposal.id
}

#[test]
fn test_place_bet_end_to_end() {
    let (keys, mut engines) = setup(4);
    let a = keys[0].peer_id();
    let before = engines[0].get_current_state().clone();

    let proposal_id = run_proposal(&mut engines, 0, bet(a, 100));

    for engine in &engines {
        let state = engine.get_current_state();
        assert_eq!(state.balance_of(&a).amount(), 900);
        assert_eq!(state.sequence_number, before.sequence_number + 1);
        assert_ne!(state.state_hash, before.state_hash);
        assert_eq!(state.total_balance(), before.total_balance());
        assert!(engine.get_pending_proposals().is_empty());
        assert_eq!(engine.proposal_status(&proposal_id), Some(ProposalStatus::Finalized));
    }
    // Every peer converged on the same state
    let hash = engines[0].get_current_state().state_hash;
    assert!(engines.iter().all(|e| e.get_current_state().state_hash == hash));
    assert_eq!(engines[0].get_metrics().rounds_completed, 1);
}

#[test]
fn test_three_for_one_against_finalizes() {
    let (keys, mut engines) = setup(4);
    let (proposal, _) = engines[0].propose(bet(keys[0].peer_id(), 50)).unwrap();

    let against = SignedVote::new(&keys[3], proposal.id, VoteChoice::Reject);
    assert!(matches!(
        engines[0].process_peer_vote(against).unwrap(),
        VoteOutcome::Pending { votes_for: 1, votes_against: 1, .. }
    ));
    let second = SignedVote::new(&keys[1], proposal.id, VoteChoice::Approve);
    assert!(matches!(
        engines[0].process_peer_vote(second).unwrap(),
        VoteOutcome::Pending { votes_for: 2, votes_against: 1, .. }
    ));
    let third = SignedVote::new(&keys[2], proposal.id, VoteChoice::Approve);
    match engines[0].process_peer_vote(third).unwrap() {
        VoteOutcome::Finalized(finalized) => {
            assert_eq!(finalized.proposal_id, proposal.id);
            assert_eq!(finalized.certificate.approvals.len(), 3);
            assert_eq!(finalized.state.sequence_number, 1);
        }
        other => panic!("expected finalization, got {:?}", other),
    }
}

#[test]
fn test_split_vote_stays_pending() {
    let (keys, mut engines) = setup(4);
    let (proposal, _) = engines[0].propose(bet(keys[0].peer_id(), 50)).unwrap();

    engines[0]
        .process_peer_vote(SignedVote::new(&keys[1], proposal.id, VoteChoice::Approve))
        .unwrap();
    engines[0]
        .process_peer_vote(SignedVote::new(&keys[2], proposal.id, VoteChoice::Reject))
        .unwrap();
    let outcome = engines[0]
        .process_peer_vote(SignedVote::new(&keys[3], proposal.id, VoteChoice::Reject))
        .unwrap();

    assert_eq!(
        outcome,
        VoteOutcome::Pending {
            votes_for: 2,
            votes_against: 2,
            abstentions: 0
        }
    );
    assert!(engines[0].get_proposal(&proposal.id).is_some());
    assert_eq!(engines[0].proposal_status(&proposal.id), None);
    assert_eq!(engines[0].get_current_state().sequence_number, 0);
}

#[test]
fn test_three_rejections_reject() {
    let (keys, mut engines) = setup(4);
    let (proposal, _) = engines[0].propose(bet(keys[0].peer_id(), 50)).unwrap();

    let mut last = None;
    for voter in &keys[1..] {
        last = Some(
            engines[0]
                .process_peer_vote(SignedVote::new(voter, proposal.id, VoteChoice::Reject))
                .unwrap(),
        );
    }
    assert!(matches!(last, Some(VoteOutcome::Rejected { .. })));
    assert_eq!(engines[0].proposal_status(&proposal.id), Some(ProposalStatus::Rejected));
    assert_eq!(engines[0].get_current_state().sequence_number, 0);

    // A fresh proposal for the same sequence is allowed again
    assert!(engines[0].propose(bet(keys[0].peer_id(), 25)).is_ok());
}

#[test]
fn test_tampered_proposal_is_rejected_by_peers() {
    let (keys, mut engines) = setup(4);
    let a = keys[0].peer_id();
    let genesis = engines[0].get_current_state().clone();
    let operation = bet(a, 100);

    // Claims the bet but forgets to debit the player
    let mut forged = ConsensusEngine::apply_operation(engines[0].config(), &genesis, &operation, a, current_timestamp()).unwrap();
    forged.player_balances.insert(a, CrapTokens::new(1_000));
    forged.state_hash = forged.compute_hash().unwrap();
    let proposal = GameProposal::new_signed(&keys[0], genesis.state_hash, forged, operation, current_timestamp()).unwrap();

    let verdict = engines[1].process_proposal(proposal).unwrap().unwrap();
    assert_eq!(verdict.vote.choice, VoteChoice::Reject);
}

#[test]
fn test_vote_is_counted_once() {
    let (keys, mut engines) = setup(4);
    let (proposal, _) = engines[0].propose(bet(keys[0].peer_id(), 50)).unwrap();
    let vote = SignedVote::new(&keys[1], proposal.id, VoteChoice::Approve);

    engines[0].process_peer_vote(vote.clone()).unwrap();
    assert!(matches!(engines[0].process_peer_vote(vote), Err(Error::DuplicateVote(_))));
    assert_eq!(engines[0].vote_tracker(&proposal.id).unwrap().total_votes(), 2);
}

#[test]
fn test_votes_before_proposal_are_replayed() {
    let (keys, mut engines) = setup(4);
    let (proposal, verdict) = engines[0].propose(bet(keys[0].peer_id(), 10)).unwrap();
    let c_vote = engines[2].process_proposal(proposal.clone()).unwrap().unwrap().vote;

    // B hears A's and C's votes before the proposal itself
    assert_eq!(engines[1].process_peer_vote(verdict.vote).unwrap(), VoteOutcome::Buffered);
    assert_eq!(engines[1].process_peer_vote(c_vote).unwrap(), VoteOutcome::Buffered);

    let verdict = engines[1].process_proposal(proposal).unwrap().unwrap();
    assert!(matches!(verdict.outcome, VoteOutcome::Finalized(_)));
    assert_eq!(engines[1].get_current_state().sequence_number, 1);
}

fn certificate(
    keys: &[SigningKeyPair],
    proposer: usize,
    approvers: std::ops::Range<usize>,
    base: &bitcraps_consensus::GameConsensusState,
    config: &ConsensusConfig,
    operation: GameOperation,
) -> FinalityCertificate {
    let timestamp = current_timestamp();
    let proposer_id = keys[proposer].peer_id();
    let state = ConsensusEngine::apply_operation(config, base, &operation, proposer_id, timestamp).unwrap();
    let proposal = GameProposal::new_signed(&keys[proposer], base.state_hash, state, operation, timestamp).unwrap();
    let approvals = keys[approvers]
        .iter()
        .map(|k| SignedVote::new(k, proposal.id, VoteChoice::Approve))
        .collect();
    FinalityCertificate { proposal, approvals }
}

#[test]
fn test_fork_with_more_confirmations_is_adopted() {
    let (keys, mut engines) = setup(7);
    let observer = &mut engines[6];
    let genesis = observer.get_current_state().clone();
    let config = observer.config().clone();
    let first_bet = bet(keys[0].peer_id(), 100);

    let canonical = certificate(&keys, 0, 0..5, &genesis, &config, first_bet.clone());
    let competing = certificate(&keys, 1, 0..7, &genesis, &config, bet(keys[1].peer_id(), 200));

    assert!(matches!(
        observer.process_certificate(canonical).unwrap(),
        CertificateOutcome::Applied(_)
    ));
    match observer.process_certificate(competing.clone()).unwrap() {
        CertificateOutcome::ForkResolved {
            resolution,
            orphaned_operations,
            ..
        } => {
            assert!(resolution.adopted);
            assert_eq!(resolution.winner, competing.proposal.proposed_state.state_hash);
            assert_eq!(orphaned_operations, vec![first_bet]);
        }
        other => panic!("expected fork resolution, got {:?}", other),
    }

    let state = observer.get_current_state();
    assert_eq!(state.state_hash, competing.proposal.proposed_state.state_hash);
    assert_eq!(state.balance_of(&keys[0].peer_id()).amount(), 1_000);
    assert_eq!(state.balance_of(&keys[1].peer_id()).amount(), 800);
    assert_eq!(observer.get_metrics().forks_resolved, 1);
}

#[test]
fn test_fork_with_fewer_confirmations_is_discarded() {
    let (keys, mut engines) = setup(7);
    let observer = &mut engines[6];
    let genesis = observer.get_current_state().clone();
    let config = observer.config().clone();

    let canonical = certificate(&keys, 0, 0..7, &genesis, &config, bet(keys[0].peer_id(), 100));
    let competing = certificate(&keys, 1, 1..6, &genesis, &config, bet(keys[1].peer_id(), 200));
    let canonical_hash = canonical.proposal.proposed_state.state_hash;

    observer.process_certificate(canonical).unwrap();
    match observer.process_certificate(competing).unwrap() {
        CertificateOutcome::ForkResolved { resolution, .. } => {
            assert!(!resolution.adopted);
            assert_eq!(resolution.winner, canonical_hash);
        }
        other => panic!("expected fork resolution, got {:?}", other),
    }
    assert_eq!(observer.get_current_state().state_hash, canonical_hash);
}

#[test]
fn test_certificate_too_far_ahead_waits_for_sync() {
    let (keys, mut engines) = setup(4);
    let genesis = engines[0].get_current_state().clone();
    let config = engines[0].config().clone();

    let first = certificate(&keys, 0, 0..3, &genesis, &config, bet(keys[0].peer_id(), 10));
    let second = certificate(
        &keys,
        1,
        0..3,
        &first.proposal.proposed_state,
        &config,
        bet(keys[1].peer_id(), 10),
    );
    assert!(matches!(
        engines[3].process_certificate(second).unwrap(),
        CertificateOutcome::Behind {
            local_sequence: 0,
            remote_sequence: 2
        }
    ));

    // The snapshot path catches the peer up
    assert!(engines[3]
        .sync_state(first.proposal.proposed_state.clone(), first.clone())
        .unwrap());
    assert_eq!(engines[3].get_current_state().sequence_number, 1);
    assert_eq!(engines[3].latest_certificate(), Some(&first));
}

#[test]
fn test_snapshot_without_quorum_certificate_is_refused() {
    let (keys, mut engines) = setup(4);
    let genesis = engines[0].get_current_state().clone();
    let config = engines[0].config().clone();
    let victim = keys[0].peer_id();
    let thief = keys[3].peer_id();

    // Well-formed snapshot that moves the victim's tokens to the thief
    let mut forged = genesis.clone();
    forged.sequence_number = 50;
    forged.last_proposer = thief;
    forged.player_balances.insert(victim, CrapTokens::new(0));
    forged.player_balances.insert(thief, CrapTokens::new(2_000));
    forged.state_hash = forged.compute_hash().unwrap();
    assert_eq!(forged.total_balance(), genesis.total_balance());

    // A genuine certificate for a different state does not vouch for it
    let unrelated = certificate(&keys, 0, 0..3, &genesis, &config, bet(victim, 10));
    assert!(matches!(
        engines[1].sync_state(forged.clone(), unrelated),
        Err(Error::InvalidState(_))
    ));

    // Nor does the thief's own approval
    let proposal = GameProposal::new_signed(
        &keys[3],
        genesis.state_hash,
        forged.clone(),
        bet(thief, 10),
        current_timestamp(),
    )
    .unwrap();
    let approvals = vec![SignedVote::new(&keys[3], proposal.id, VoteChoice::Approve)];
    let self_signed = FinalityCertificate { proposal, approvals };
    assert!(matches!(
        engines[1].sync_state(forged, self_signed),
        Err(Error::InsufficientVotes(_))
    ));

    let state = engines[1].get_current_state();
    assert_eq!(state.sequence_number, 0);
    assert_eq!(state.balance_of(&victim).amount(), 1_000);
    assert_eq!(state.balance_of(&thief).amount(), 1_000);
}

enum RoundMessage {
    Commit(bitcraps_consensus::protocol::consensus::RandomnessCommit),
    Reveal(bitcraps_consensus::protocol::consensus::RandomnessReveal),
}

#[test]
fn test_randomness_round_then_roll() {
    let (keys, mut engines) = setup(4);
    let a = keys[0].peer_id();
    run_proposal(&mut engines, 0, bet(a, 100));

    let now = current_timestamp();
    let mut queue = VecDeque::new();
    queue.push_back((0usize, RoundMessage::Commit(engines[0].start_randomness_round_at(1, now).unwrap())));
    let mut outcomes = vec![None; engines.len()];

    while let Some((from, message)) = queue.pop_front() {
        for (i, engine) in engines.iter_mut().enumerate() {
            if i == from {
                continue;
            }
            let events = match &message {
                RoundMessage::Commit(commit) => engine.process_randomness_commit_at(commit.clone(), now).unwrap(),
                RoundMessage::Reveal(reveal) => engine.process_randomness_reveal(reveal.clone()).unwrap(),
            };
            for event in events {
                match event {
                    RoundEvent::Commit(commit) => queue.push_back((i, RoundMessage::Commit(commit))),
                    RoundEvent::Reveal(reveal) => queue.push_back((i, RoundMessage::Reveal(reveal))),
                    RoundEvent::Completed(outcome) => outcomes[i] = Some(outcome),
                    RoundEvent::Aborted { reason, .. } => panic!("round aborted: {}", reason),
                }
            }
        }
    }

    let first = outcomes[0].clone().expect("round completed");
    assert!(outcomes.iter().all(|o| o.as_ref() == Some(&first)));
    assert_eq!(first.contributors.len(), 4);

    let roll = engines[0].roll_operation(1).unwrap();
    run_proposal(&mut engines, 0, roll);
    for engine in &engines {
        let game = &engine.get_current_state().game_state;
        assert_eq!(game.roll_count, 1);
        assert_eq!(game.last_roll, Some(first.dice));
        assert_eq!(game.last_round_id, Some(1));
        assert_eq!(engine.get_current_state().sequence_number, 2);
    }

    // Natural wins, craps loses, anything else sets the point
    let state = engines[0].get_current_state();
    match first.dice.total() {
        7 | 11 => assert_eq!(state.balance_of(&a).amount(), 1_100),
        2 | 3 | 12 => assert_eq!(state.balance_of(&a).amount(), 900),
        point => {
            assert_eq!(state.game_state.phase, GamePhase::Point);
            assert_eq!(state.game_state.point, Some(point));
        }
    }
}

#[test]
fn test_upheld_dispute_compensates_through_consensus() {
    let (keys, mut engines) = setup(4);
    let a = keys[0].peer_id();
    let treasury_before = engines[0].get_current_state().balance_of(&TREASURY_ADDRESS).amount();

    let claim = DisputeClaim::InvalidPayout {
        player: a,
        expected: CrapTokens::new(150),
        actual: CrapTokens::new(100),
    };
    let dispute_id = engines[0].raise_dispute(claim, Vec::new()).unwrap();
    let dispute = engines[0].get_dispute(&dispute_id).cloned().unwrap();
    for engine in engines.iter_mut().skip(1) {
        assert!(engine.process_dispute(dispute.clone()).unwrap());
    }

    // Frozen: no local submissions, peers abstain
    assert!(engines[0].is_frozen());
    assert!(matches!(engines[1].propose(bet(keys[1].peer_id(), 10)), Err(Error::GameFrozen(_))));

    let mut votes = Vec::new();
    for engine in engines.iter_mut().take(3) {
        let (vote, resolution) = engine
            .vote_on_dispute(dispute_id, bitcraps_consensus::protocol::consensus::DisputeVoteType::Uphold, String::new())
            .unwrap();
        assert!(resolution.is_none());
        votes.push(vote);
    }

    let mut compensation = None;
    for engine in engines.iter_mut() {
        let me = engine.local_peer_id();
        for vote in votes.iter().filter(|v| v.voter != me) {
            if let Some(resolution) = engine.process_dispute_vote(vote.clone()).unwrap() {
                assert_eq!(resolution.outcome, DisputeOutcome::Upheld);
                if me == a {
                    compensation = resolution.compensation;
                }
            }
        }
        assert!(!engine.is_frozen());
    }

    let compensation = compensation.expect("upheld payout dispute carries a correction");
    run_proposal(&mut engines, 0, compensation);
    for engine in &engines {
        let state = engine.get_current_state();
        assert_eq!(state.balance_of(&a).amount(), 1_050);
        assert_eq!(state.balance_of(&TREASURY_ADDRESS).amount(), treasury_before - 50);
    }
}
