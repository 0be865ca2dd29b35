//! Bridges wired together over one in-memory hub

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use bitcraps_consensus::protocol::consensus::{DisputeClaim, DisputeOutcome, DisputeVoteType};
use bitcraps_consensus::protocol::current_timestamp;
use bitcraps_consensus::{
    BetType, ConsensusConfig, ConsensusEngine, ConsensusEvent, CrapTokens, GameOperation, GameSession,
    InMemoryTransport, NetworkConsensusBridge, NetworkConsensusBridgeConfig, SigningKeyPair,
};

struct Table {
    keys: Vec<SigningKeyPair>,
    bridges: Vec<NetworkConsensusBridge>,
}

/// Build `n` participants but only start bridges for the first `running`
async fn table(n: usize, running: usize, config: NetworkConsensusBridgeConfig) -> Table {
    let keys: Vec<SigningKeyPair> = (0..n).map(|_| SigningKeyPair::generate()).collect();
    let session = GameSession::new([5; 16], keys.iter().map(|k| k.peer_id()).collect(), current_timestamp()).unwrap();
    let hub = Arc::new(InMemoryTransport::default());

    let mut bridges = Vec::new();
    for k in keys.iter().take(running) {
        let engine = ConsensusEngine::new(session.clone(), k.clone(), ConsensusConfig::default()).unwrap();
        let bridge = NetworkConsensusBridge::new(engine, k.clone(), hub.clone(), config.clone()).unwrap();
        bridge.start().await.unwrap();
        bridges.push(bridge);
    }
    Table { keys, bridges }
}

async fn next_matching<F>(events: &mut broadcast::Receiver<ConsensusEvent>, mut predicate: F) -> ConsensusEvent
where
    F: FnMut(&ConsensusEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn pass_bet(player: [u8; 32], amount: u64) -> GameOperation {
    GameOperation::PlaceBet {
        player,
        bet_type: BetType::Pass,
        amount: CrapTokens::new(amount),
    }
}

#[tokio::test]
async fn test_four_bridges_finalize_bet() {
    let table = table(4, 4, NetworkConsensusBridgeConfig::default()).await;
    let mut receivers: Vec<_> = table.bridges.iter().map(|b| b.subscribe_events()).collect();
    let a = table.keys[0].peer_id();

    let proposal_id = table.bridges[0].submit_operation(pass_bet(a, 100)).await.unwrap();

    for (i, events) in receivers.iter_mut().enumerate() {
        let event = next_matching(events, |e| matches!(e, ConsensusEvent::ProposalFinalized { .. })).await;
        let ConsensusEvent::ProposalFinalized {
            proposal_id: finalized,
            sequence_number,
            local,
            ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(finalized, proposal_id);
        assert_eq!(sequence_number, 1);
        assert_eq!(local, i == 0);
    }

    let hash = table.bridges[0].get_current_state().state_hash;
    for bridge in &table.bridges {
        let state = bridge.get_current_state();
        assert_eq!(state.state_hash, hash);
        assert_eq!(state.balance_of(&a).amount(), 900);
        assert!(bridge.get_pending_operations().is_empty());
    }
    assert_eq!(table.bridges[0].get_stats().consensus_rounds_completed, 1);
    assert!(table.bridges[0].is_consensus_healthy());

    for bridge in &table.bridges {
        bridge.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_operation_times_out_without_quorum() {
    // Only the submitter is online: 1 of 4 votes
    let table = table(4, 1, NetworkConsensusBridgeConfig::default()).await;
    let bridge = &table.bridges[0];
    let mut events = bridge.subscribe_events();

    let proposal_id = bridge
        .submit_operation(pass_bet(table.keys[0].peer_id(), 100))
        .await
        .unwrap();
    assert_eq!(bridge.vote_progress(&proposal_id), Some((1, 3)));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(bridge.get_pending_operations().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let event = next_matching(&mut events, |e| matches!(e, ConsensusEvent::OperationTimedOut { .. })).await;
    assert!(matches!(event, ConsensusEvent::OperationTimedOut { proposal_id: id, .. } if id == proposal_id));

    assert!(bridge.get_pending_operations().is_empty());
    assert_eq!(bridge.get_stats().failed_operations, 1);
    assert_eq!(bridge.get_current_state().sequence_number, 0);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_randomness_round_and_roll() {
    let table = table(4, 4, NetworkConsensusBridgeConfig::default()).await;
    let mut receivers: Vec<_> = table.bridges.iter().map(|b| b.subscribe_events()).collect();

    table.bridges[0].start_randomness_round(1).await.unwrap();

    let mut dice = Vec::new();
    for events in receivers.iter_mut() {
        match next_matching(events, |e| matches!(e, ConsensusEvent::RandomnessReady { .. })).await {
            ConsensusEvent::RandomnessReady { round_id, dice: roll } => {
                assert_eq!(round_id, 1);
                dice.push(roll);
            }
            _ => unreachable!(),
        }
    }
    assert!(dice.windows(2).all(|w| w[0] == w[1]));

    let roll_id = table.bridges[0].submit_roll(1).await.unwrap();
    for events in receivers.iter_mut() {
        next_matching(events, |e| {
            matches!(e, ConsensusEvent::ProposalFinalized { proposal_id, .. } if *proposal_id == roll_id)
        })
        .await;
    }
    for bridge in &table.bridges {
        let game = &bridge.get_current_state().game_state;
        assert_eq!(game.last_roll, Some(dice[0]));
        assert_eq!(game.roll_count, 1);
    }

    for bridge in &table.bridges {
        bridge.shutdown().await;
    }
}

#[tokio::test]
async fn test_upheld_dispute_submits_compensation() {
    let table = table(4, 4, NetworkConsensusBridgeConfig::default()).await;
    let mut receivers: Vec<_> = table.bridges.iter().map(|b| b.subscribe_events()).collect();
    let a = table.keys[0].peer_id();

    let claim = DisputeClaim::InvalidPayout {
        player: a,
        expected: CrapTokens::new(120),
        actual: CrapTokens::new(100),
    };
    let dispute_id = table.bridges[0].raise_dispute(claim, Vec::new()).await.unwrap();
    for events in receivers.iter_mut().skip(1) {
        next_matching(events, |e| matches!(e, ConsensusEvent::DisputeRaised { .. })).await;
    }

    for bridge in table.bridges.iter().take(3) {
        bridge
            .vote_on_dispute(dispute_id, DisputeVoteType::Uphold, "payout short by 20".to_string())
            .await
            .unwrap();
    }

    let compensation = next_matching(&mut receivers[0], |e| {
        matches!(e, ConsensusEvent::CompensationSubmitted { .. })
    })
    .await;
    let ConsensusEvent::CompensationSubmitted { proposal_id, .. } = compensation else {
        unreachable!()
    };

    for events in receivers.iter_mut().skip(1) {
        let resolved = next_matching(events, |e| matches!(e, ConsensusEvent::DisputeResolved { .. })).await;
        assert!(matches!(
            resolved,
            ConsensusEvent::DisputeResolved {
                outcome: DisputeOutcome::Upheld,
                expired: false,
                ..
            }
        ));
    }
    for events in receivers.iter_mut() {
        next_matching(events, |e| {
            matches!(e, ConsensusEvent::ProposalFinalized { proposal_id: id, .. } if *id == proposal_id)
        })
        .await;
    }
    for bridge in &table.bridges {
        assert_eq!(bridge.get_current_state().balance_of(&a).amount(), 1_020);
    }

    for bridge in &table.bridges {
        bridge.shutdown().await;
    }
}

#[tokio::test]
async fn test_lagging_peer_catches_up_by_state_sync() {
    let config = NetworkConsensusBridgeConfig {
        state_sync_interval: Duration::from_millis(100),
        ..NetworkConsensusBridgeConfig::default()
    };
    let keys: Vec<SigningKeyPair> = (0..4).map(|_| SigningKeyPair::generate()).collect();
    let session = GameSession::new([6; 16], keys.iter().map(|k| k.peer_id()).collect(), current_timestamp()).unwrap();
    let hub = Arc::new(InMemoryTransport::default());

    let mut bridges = Vec::new();
    for k in keys.iter().take(3) {
        let engine = ConsensusEngine::new(session.clone(), k.clone(), ConsensusConfig::default()).unwrap();
        let bridge = NetworkConsensusBridge::new(engine, k.clone(), hub.clone(), config.clone()).unwrap();
        bridge.start().await.unwrap();
        bridges.push(bridge);
    }
    let mut events = bridges[0].subscribe_events();
    let proposal_id = bridges[0].submit_operation(pass_bet(keys[0].peer_id(), 40)).await.unwrap();
    next_matching(&mut events, |e| {
        matches!(e, ConsensusEvent::ProposalFinalized { proposal_id: id, .. } if *id == proposal_id)
    })
    .await;

    // The fourth peer joins late and only learns the state from snapshots
    let engine = ConsensusEngine::new(session, keys[3].clone(), ConsensusConfig::default()).unwrap();
    let late = NetworkConsensusBridge::new(engine, keys[3].clone(), hub.clone(), config).unwrap();
    let mut late_events = late.subscribe_events();
    late.start().await.unwrap();

    let synced = next_matching(&mut late_events, |e| matches!(e, ConsensusEvent::StateSynced { .. })).await;
    assert!(matches!(synced, ConsensusEvent::StateSynced { sequence_number: 1, .. }));
    assert_eq!(late.get_current_state().state_hash, bridges[0].get_current_state().state_hash);
    assert_eq!(late.get_stats().state_syncs, 1);

    late.shutdown().await;
    for bridge in &bridges {
        bridge.shutdown().await;
    }
}
