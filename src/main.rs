use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use bitcraps_consensus::logging::init_logging;
use bitcraps_consensus::protocol::{current_timestamp, new_game_id, short_hex};
use bitcraps_consensus::transport;
use bitcraps_consensus::{
    BetType, Config, ConsensusEngine, ConsensusEvent, CrapTokens, Error, GameOperation, GameSession,
    NetworkConsensusBridge, Result, SigningKeyPair, TREASURY_ADDRESS,
};

/// Command-line interface for a BitCraps consensus node
#[derive(Parser)]
#[command(name = "bitcraps-consensus")]
#[command(about = "Byzantine fault tolerant game-state consensus for BitCraps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several in-process peers through a bet, a dice roll and settlement
    Simulate {
        #[arg(short, long, default_value = "4")]
        peers: usize,

        #[arg(short, long, default_value = "100")]
        bet: u64,

        /// Seconds to wait for each consensus step. A lone peer only reveals
        /// once the commit window closes.
        #[arg(long, default_value = "30")]
        step_timeout: u64,
    },

    /// Load and validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    config.override_from_env()?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Simulate {
            peers,
            bet,
            step_timeout,
        } => {
            config.validate()?;
            simulate(&config, peers, bet, Duration::from_secs(step_timeout)).await
        }
        Commands::CheckConfig { path } => check_config(&path),
    }
}

fn check_config(path: &PathBuf) -> Result<()> {
    let mut config = Config::load_from_file(path)?;
    config.override_from_env()?;
    config.validate()?;

    tracing::info!(
        transport = ?config.transport.kind,
        consensus_timeout = ?config.bridge.consensus_timeout,
        state_sync_interval = ?config.bridge.state_sync_interval,
        min_bet = config.consensus.min_bet,
        max_bet = config.consensus.max_bet,
        "Configuration {} is valid",
        path.display()
    );
    Ok(())
}

async fn simulate(config: &Config, peers: usize, bet: u64, step_timeout: Duration) -> Result<()> {
    if peers == 0 {
        return Err(Error::Config("simulation needs at least one peer".to_string()));
    }

    let keys: Vec<SigningKeyPair> = (0..peers).map(|_| SigningKeyPair::generate()).collect();
    let session = GameSession::new(
        new_game_id(),
        keys.iter().map(|k| k.peer_id()).collect(),
        current_timestamp(),
    )?;
    let hub = transport::connect(&config.transport).await?;

    tracing::info!(
        game = %short_hex(&session.game_id),
        peers,
        transport = hub.name(),
        "Starting simulated game"
    );

    let mut bridges = Vec::with_capacity(peers);
    for peer_keys in &keys {
        let engine = ConsensusEngine::new(session.clone(), peer_keys.clone(), config.consensus.clone())?
            .with_randomness_config(config.randomness.clone())
            .with_dispute_config(config.dispute.clone());
        let bridge = NetworkConsensusBridge::new(engine, peer_keys.clone(), Arc::clone(&hub), config.bridge.clone())?;
        bridge.start().await?;
        bridges.push(bridge);
    }

    let shooter = &bridges[0];
    let player = shooter.local_peer_id();
    let mut events = shooter.subscribe_events();

    let bet_id = shooter
        .submit_operation(GameOperation::PlaceBet {
            player,
            bet_type: BetType::Pass,
            amount: CrapTokens::new(bet),
        })
        .await?;
    wait_for_finalized(&mut events, bet_id, step_timeout).await?;
    tracing::info!(proposal = %short_hex(&bet_id), amount = bet, "Pass bet finalized");

    let round_id = 1;
    shooter.start_randomness_round(round_id).await?;
    let dice = tokio::time::timeout(step_timeout, async {
        loop {
            match events.recv().await {
                Ok(ConsensusEvent::RandomnessReady { round_id: id, dice }) if id == round_id => return Ok(dice),
                Ok(ConsensusEvent::RandomnessAborted { reason, .. }) => return Err(Error::Randomness(reason)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::InvalidState("event stream closed".to_string()))
                }
            }
        }
    })
    .await
    .map_err(|_| Error::Randomness(format!("round {} did not complete", round_id)))??;
    tracing::info!(round_id, die1 = dice.die1, die2 = dice.die2, total = dice.total(), "Dice agreed");

    let roll_id = shooter.submit_roll(round_id).await?;
    wait_for_finalized(&mut events, roll_id, step_timeout).await?;

    let state = shooter.get_current_state();
    tracing::info!(
        sequence = state.sequence_number,
        state_hash = %short_hex(&state.state_hash),
        phase = ?state.game_state.phase,
        point = ?state.game_state.point,
        "Roll settled"
    );
    for bridge in &bridges {
        let peer = bridge.local_peer_id();
        let view = bridge.get_current_state();
        tracing::info!(
            peer = %short_hex(&peer),
            balance = view.balance_of(&peer).amount(),
            sequence = view.sequence_number,
            in_agreement = view.state_hash == state.state_hash,
            "Peer view"
        );
    }
    tracing::info!(treasury = state.balance_of(&TREASURY_ADDRESS).amount(), "Treasury balance");

    let stats = shooter.get_stats();
    tracing::info!(
        rounds = stats.consensus_rounds_completed,
        processed = stats.messages_processed,
        rejected = stats.messages_rejected,
        duplicates = stats.duplicates_dropped,
        "Shooter statistics"
    );

    for bridge in &bridges {
        bridge.shutdown().await;
    }
    Ok(())
}

async fn wait_for_finalized(
    events: &mut broadcast::Receiver<ConsensusEvent>,
    proposal_id: [u8; 32],
    step_timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(step_timeout, async {
        loop {
            match events.recv().await {
                Ok(ConsensusEvent::ProposalFinalized { proposal_id: id, .. }) if id == proposal_id => return Ok(()),
                Ok(ConsensusEvent::ProposalRejected { proposal_id: id, reason }) if id == proposal_id => {
                    return Err(Error::InvalidProposal(reason))
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::InvalidState("event stream closed".to_string()))
                }
            }
        }
    })
    .await
    .map_err(|_| Error::consensus_timeout(short_hex(&proposal_id), step_timeout.as_millis()))?
}
