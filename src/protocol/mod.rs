//! Protocol types for BitCraps game-state consensus
//!
//! This module holds the identifiers, token and dice primitives shared by the
//! consensus engine, the commit-reveal randomness subsystem and the network
//! bridge. Submodules:
//! - `craps`: the game rules state embedded in every consensus snapshot
//! - `consensus`: proposal/vote state machine, randomness, disputes, forks
//! - `p2p_messages`: signed message envelopes exchanged between peers
//! - `network_consensus_bridge`: async adapter between engine and transport

pub mod consensus;
pub mod craps;
pub mod network_consensus_bridge;
pub mod p2p_messages;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// Protocol constants
pub const NONCE_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

// Gaming constants
pub const INITIAL_CRAP_TOKENS: u64 = 1000;
pub const INITIAL_TREASURY_TOKENS: u64 = 1_000_000;
pub const MIN_BET_AMOUNT: u64 = 1;
pub const MAX_BET_AMOUNT: u64 = 10_000;

/// Peer identifier - the 32-byte Ed25519 verifying key of the participant
pub type PeerId = [u8; 32];

/// Game identifier - 16 bytes
pub type GameId = [u8; 16];

/// SHA-256 digest
pub type Hash256 = [u8; 32];

/// Account that escrows bet stakes and pays out winnings.
///
/// Feynman: The house is just another wallet in the balance map, so every bet
/// and every payout is a transfer and the table never mints tokens.
pub const TREASURY_ADDRESS: PeerId = [0xFFu8; 32];

/// Create a new GameId using cryptographic randomness
pub fn new_game_id() -> GameId {
    use rand::RngCore;
    let mut game_id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut game_id);
    game_id
}

/// Current wall-clock time in whole seconds since the Unix epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Short hex prefix of an identifier, for log lines
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(6)])
}

/// Wrapper for an Ed25519 signature to enable serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

// Manual impl for Serialize/Deserialize for fixed-size arrays > 32
impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SignatureVisitor;

        impl<'de> serde::de::Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("64 bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() == SIGNATURE_SIZE {
                    let mut arr = [0u8; SIGNATURE_SIZE];
                    arr.copy_from_slice(v);
                    Ok(Signature(arr))
                } else {
                    Err(E::custom(format!("expected {} bytes", SIGNATURE_SIZE)))
                }
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut arr = [0u8; SIGNATURE_SIZE];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature(arr))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

/// CRAP token amount in the smallest unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CrapTokens {
    pub amount: u64,
}

impl CrapTokens {
    pub fn new(amount: u64) -> Self {
        Self { amount }
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Add tokens with overflow checking
    pub fn checked_add(&self, other: CrapTokens) -> Result<CrapTokens> {
        self.amount
            .checked_add(other.amount)
            .map(CrapTokens::new)
            .ok_or_else(|| Error::ArithmeticOverflow("Token addition overflow".to_string()))
    }

    /// Subtract tokens with underflow checking
    pub fn checked_sub(&self, other: CrapTokens) -> Result<CrapTokens> {
        self.amount
            .checked_sub(other.amount)
            .map(CrapTokens::new)
            .ok_or_else(|| Error::insufficient_balance_for("debit", other.amount, self.amount))
    }
}

/// Represents a dice roll result
/// Feynman: Two cubes, each showing 1-6, determine everyone's fate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub die1: u8,
    pub die2: u8,
}

impl DiceRoll {
    pub fn new(die1: u8, die2: u8) -> Result<Self> {
        if !(1..=6).contains(&die1) {
            return Err(Error::InvalidOperation(format!(
                "Invalid die1 value: {}, must be 1-6",
                die1
            )));
        }
        if !(1..=6).contains(&die2) {
            return Err(Error::InvalidOperation(format!(
                "Invalid die2 value: {}, must be 1-6",
                die2
            )));
        }
        Ok(Self { die1, die2 })
    }

    /// Build a roll from a slice of exactly two die values
    pub fn from_values(values: &[u8]) -> Result<Self> {
        match values {
            [die1, die2] => Self::new(*die1, *die2),
            _ => Err(Error::InvalidOperation(format!(
                "Expected 2 dice values, got {}",
                values.len()
            ))),
        }
    }

    /// The sum is what matters in craps - 2 through 12
    pub fn total(&self) -> u8 {
        self.die1 + self.die2
    }

    /// "Craps" are the losing numbers on comeout - 2, 3, or 12
    pub fn is_craps(&self) -> bool {
        matches!(self.total(), 2 | 3 | 12)
    }

    /// "Natural" winners on comeout - 7 or 11
    pub fn is_natural(&self) -> bool {
        matches!(self.total(), 7 | 11)
    }
}

/// Bet types supported by the consensus table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BetType {
    // Line bets, resolved across come-out and point rolls
    Pass = 0,
    DontPass = 1,
    // One-roll bets
    Field = 4,
    Any7 = 5,
    AnyCraps = 6,
}

impl BetType {
    /// Line bets can only be placed on the come-out roll
    pub fn is_line_bet(&self) -> bool {
        matches!(self, BetType::Pass | BetType::DontPass)
    }
}

/// Active wager escrowed in the game state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub player: PeerId,
    pub bet_type: BetType,
    pub amount: CrapTokens,
}
