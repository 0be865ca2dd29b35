//! Property-based tests for consensus invariants
//!
//! Keys are generated per case, so case counts are kept modest.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

use bitcraps_consensus::protocol::consensus::{
    byzantine_threshold, ConsensusConfig, ConsensusEngine, GameConsensusState, GameOperation, GameSession,
    ProposalStatus, SignedVote, VoteChoice, VoteTracker,
};
use bitcraps_consensus::protocol::{BetType, CrapTokens, PeerId, TREASURY_ADDRESS};
use bitcraps_consensus::SigningKeyPair;

fn arb_choice() -> impl Strategy<Value = VoteChoice> {
    prop_oneof![
        3 => Just(VoteChoice::Approve),
        2 => Just(VoteChoice::Reject),
        1 => Just(VoteChoice::Abstain),
    ]
}

fn arb_bet_type() -> impl Strategy<Value = BetType> {
    prop_oneof![
        Just(BetType::Pass),
        Just(BetType::DontPass),
        Just(BetType::Field),
        Just(BetType::Any7),
        Just(BetType::AnyCraps),
    ]
}

/// Operation templates over player indices, resolved against real peer ids later
#[derive(Debug, Clone)]
enum OpTemplate {
    Bet(usize, BetType, u64),
    Cancel(usize, BetType),
    Roll(u8, u8),
    Transfer(usize, usize, i64),
}

fn arb_op() -> impl Strategy<Value = OpTemplate> {
    prop_oneof![
        4 => (0usize..4, arb_bet_type(), 1u64..1_500).prop_map(|(p, t, a)| OpTemplate::Bet(p, t, a)),
        1 => (0usize..4, arb_bet_type()).prop_map(|(p, t)| OpTemplate::Cancel(p, t)),
        3 => (1u8..=6, 1u8..=6).prop_map(|(d1, d2)| OpTemplate::Roll(d1, d2)),
        1 => (0usize..4, 0usize..4, 1i64..500).prop_map(|(f, t, a)| OpTemplate::Transfer(f, t, a)),
    ]
}

/// Final status of a proposal after `choices` are delivered in `order`
fn decide(keys: &[SigningKeyPair], choices: &[VoteChoice], order: &[usize]) -> (Option<ProposalStatus>, u64) {
    let session = GameSession::new([4; 16], keys.iter().map(|k| k.peer_id()).collect(), 1_000).unwrap();
    let mut engine = ConsensusEngine::new(session, keys[0].clone(), ConsensusConfig::default()).unwrap();
    let operation = GameOperation::PlaceBet {
        player: keys[0].peer_id(),
        bet_type: BetType::Pass,
        amount: CrapTokens::new(10),
    };
    let (proposal, _) = engine.propose(operation).unwrap();

    for &i in order {
        let vote = SignedVote::new(&keys[i + 1], proposal.id, choices[i]);
        engine.process_peer_vote(vote).unwrap();
    }
    (engine.proposal_status(&proposal.id), engine.get_current_state().sequence_number)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_decision_independent_of_vote_order(
        (choices, order) in (3usize..7).prop_flat_map(|peers| {
            let choices = prop::collection::vec(arb_choice(), peers);
            let order = Just((0..peers).collect::<Vec<usize>>()).prop_shuffle();
            (choices, order)
        })
    ) {
        let keys: Vec<SigningKeyPair> = (0..=choices.len()).map(|_| SigningKeyPair::generate()).collect();
        let in_order: Vec<usize> = (0..choices.len()).collect();

        let expected = decide(&keys, &choices, &in_order);
        let shuffled = decide(&keys, &choices, &order);
        prop_assert_eq!(expected, shuffled);

        // The decision is a function of the final tally
        let approvals = 1 + choices.iter().filter(|c| **c == VoteChoice::Approve).count();
        let rejections = choices.iter().filter(|c| **c == VoteChoice::Reject).count();
        let required = byzantine_threshold(keys.len());
        let status = if approvals >= required {
            Some(ProposalStatus::Finalized)
        } else if rejections >= required {
            Some(ProposalStatus::Rejected)
        } else {
            None
        };
        prop_assert_eq!(expected.0, status);
    }

    #[test]
    fn prop_each_voter_counted_once(
        ballots in prop::collection::vec((0u8..8, arb_choice()), 1..40)
    ) {
        let mut tracker = VoteTracker::new([1; 32]);
        let mut voters = HashSet::new();
        for (voter, choice) in ballots {
            let peer: PeerId = [voter; 32];
            let first = voters.insert(peer);
            prop_assert_eq!(tracker.record(peer, choice).is_ok(), first);
        }
        prop_assert_eq!(tracker.total_votes(), voters.len());
    }

    #[test]
    fn prop_operations_conserve_tokens(ops in prop::collection::vec(arb_op(), 1..40)) {
        let players: Vec<PeerId> = (1..=4u8).map(|i| [i; 32]).collect();
        let session = GameSession::new([2; 16], players.clone(), 1_000).unwrap();
        let config = ConsensusConfig::default();
        let mut state = GameConsensusState::genesis(&session, &config).unwrap();
        let total = state.total_balance();
        let mut round_id = 0;

        for (step, op) in ops.into_iter().enumerate() {
            let operation = match op {
                OpTemplate::Bet(p, bet_type, amount) => GameOperation::PlaceBet {
                    player: players[p],
                    bet_type,
                    amount: CrapTokens::new(amount),
                },
                OpTemplate::Cancel(p, bet_type) => GameOperation::CancelBet { player: players[p], bet_type },
                OpTemplate::Roll(d1, d2) => {
                    round_id += 1;
                    GameOperation::ProcessRoll {
                        round_id,
                        dice_values: vec![d1, d2],
                        entropy_proof: vec![[0; 32]],
                    }
                }
                OpTemplate::Transfer(from, to, amount) => {
                    let mut changes = BTreeMap::new();
                    changes.insert(players[from], -amount);
                    *changes.entry(players[to]).or_insert(0) += amount;
                    GameOperation::UpdateBalances { changes, reason: "transfer".to_string() }
                }
            };

            let proposer = players[step % players.len()];
            if let Ok(next) = ConsensusEngine::apply_operation(&config, &state, &operation, proposer, 1_000 + step as u64) {
                prop_assert_eq!(next.total_balance(), total);
                prop_assert_eq!(next.sequence_number, state.sequence_number + 1);
                prop_assert!(next.verify_hash().unwrap());
                state = next;
            }
        }

        // Escrow covers every open stake
        let escrowed: u64 = state
            .game_state
            .bets
            .values()
            .flat_map(|bets| bets.values())
            .map(|bet| bet.amount.amount())
            .sum();
        prop_assert!(state.balance_of(&TREASURY_ADDRESS).amount() >= escrowed);
    }
}
