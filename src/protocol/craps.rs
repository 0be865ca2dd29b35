//! Craps rules state carried inside every consensus snapshot
//!
//! The table tracks the come-out/point cycle and the active wagers. It never
//! touches balances: placing a bet or resolving a roll only reports what moved
//! so the consensus layer can apply the matching treasury transfers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Bet, BetType, CrapTokens, DiceRoll, GameId, PeerId};
use crate::error::{Error, Result};

/// Game phase in craps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePhase {
    ComeOut,
    Point,
}

/// Result of bet resolution
///
/// `payout` on a win is the full amount returned from escrow, stake included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetResolution {
    Won {
        player: PeerId,
        bet_type: BetType,
        amount: CrapTokens,
        payout: CrapTokens,
    },
    Lost {
        player: PeerId,
        bet_type: BetType,
        amount: CrapTokens,
    },
    Push {
        player: PeerId,
        bet_type: BetType,
        amount: CrapTokens,
    },
}

impl BetResolution {
    pub fn player(&self) -> PeerId {
        match self {
            BetResolution::Won { player, .. }
            | BetResolution::Lost { player, .. }
            | BetResolution::Push { player, .. } => *player,
        }
    }

    pub fn bet_type(&self) -> BetType {
        match self {
            BetResolution::Won { bet_type, .. }
            | BetResolution::Lost { bet_type, .. }
            | BetResolution::Push { bet_type, .. } => *bet_type,
        }
    }

    /// Tokens the treasury hands back to the player for this resolution
    pub fn returned_to_player(&self) -> CrapTokens {
        match self {
            BetResolution::Won { payout, .. } => *payout,
            BetResolution::Push { amount, .. } => *amount,
            BetResolution::Lost { .. } => CrapTokens::default(),
        }
    }

    pub fn is_win(&self) -> bool {
        matches!(self, BetResolution::Won { .. })
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, BetResolution::Lost { .. })
    }

    pub fn is_push(&self) -> bool {
        matches!(self, BetResolution::Push { .. })
    }
}

/// What a single roll does to one bet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollEffect {
    /// Win paying `multiplier`:1
    Win(u64),
    Lose,
    Push,
    /// Bet stays on the table
    Stay,
}

/// Craps table state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrapsGame {
    pub game_id: GameId,
    pub phase: GamePhase,
    pub point: Option<u8>,
    /// Active bets keyed by player, then bet type
    pub bets: BTreeMap<PeerId, BTreeMap<BetType, Bet>>,
    pub roll_count: u64,
    pub last_roll: Option<DiceRoll>,
    /// Last randomness round whose outcome was applied
    pub last_round_id: Option<u64>,
}

impl CrapsGame {
    pub fn new(game_id: GameId) -> Self {
        Self {
            game_id,
            phase: GamePhase::ComeOut,
            point: None,
            bets: BTreeMap::new(),
            roll_count: 0,
            last_roll: None,
            last_round_id: None,
        }
    }

    /// Check whether a bet type may be placed in the current phase
    pub fn accepts(&self, bet_type: BetType) -> bool {
        !bet_type.is_line_bet() || self.phase == GamePhase::ComeOut
    }

    /// Escrow a new bet. A repeat bet of the same type adds to the stake.
    pub fn place_bet(&mut self, bet: Bet) -> Result<()> {
        if bet.amount.amount() == 0 {
            return Err(Error::InvalidOperation("Bet amount must be positive".to_string()));
        }
        if !self.accepts(bet.bet_type) {
            return Err(Error::InvalidOperation(format!(
                "{:?} bets are only accepted on the come-out roll",
                bet.bet_type
            )));
        }

        let player_bets = self.bets.entry(bet.player).or_default();
        match player_bets.get_mut(&bet.bet_type) {
            Some(existing) => {
                existing.amount = existing.amount.checked_add(bet.amount)?;
            }
            None => {
                player_bets.insert(bet.bet_type, bet);
            }
        }
        Ok(())
    }

    pub fn get_bet(&self, player: &PeerId, bet_type: BetType) -> Option<&Bet> {
        self.bets.get(player).and_then(|bets| bets.get(&bet_type))
    }

    /// Take a bet off the table, returning it so the stake can be refunded
    pub fn remove_bet(&mut self, player: &PeerId, bet_type: BetType) -> Option<Bet> {
        let player_bets = self.bets.get_mut(player)?;
        let bet = player_bets.remove(&bet_type);
        if player_bets.is_empty() {
            self.bets.remove(player);
        }
        bet
    }

    /// Total tokens currently escrowed on the table
    pub fn total_escrowed(&self) -> u64 {
        self.bets
            .values()
            .flat_map(|bets| bets.values())
            .map(|bet| bet.amount.amount())
            .sum()
    }

    /// Apply a roll: resolve bets, advance the phase, record the round.
    pub fn process_roll(&mut self, roll: DiceRoll, round_id: u64) -> Result<Vec<BetResolution>> {
        let mut resolutions = Vec::new();
        let phase = self.phase;
        let point = self.point;

        for player_bets in self.bets.values_mut() {
            let mut settled = Vec::new();
            for (bet_type, bet) in player_bets.iter() {
                let effect = Self::roll_effect(*bet_type, phase, point, roll);
                let resolution = match effect {
                    RollEffect::Stay => continue,
                    RollEffect::Win(multiplier) => BetResolution::Won {
                        player: bet.player,
                        bet_type: *bet_type,
                        amount: bet.amount,
                        payout: Self::payout(bet.amount, multiplier)?,
                    },
                    RollEffect::Lose => BetResolution::Lost {
                        player: bet.player,
                        bet_type: *bet_type,
                        amount: bet.amount,
                    },
                    RollEffect::Push => BetResolution::Push {
                        player: bet.player,
                        bet_type: *bet_type,
                        amount: bet.amount,
                    },
                };
                settled.push(*bet_type);
                resolutions.push(resolution);
            }
            for bet_type in settled {
                player_bets.remove(&bet_type);
            }
        }
        self.bets.retain(|_, bets| !bets.is_empty());

        self.update_phase(roll.total());
        self.roll_count += 1;
        self.last_roll = Some(roll);
        self.last_round_id = Some(round_id);

        Ok(resolutions)
    }

    fn update_phase(&mut self, total: u8) {
        match self.phase {
            GamePhase::ComeOut => {
                if matches!(total, 4 | 5 | 6 | 8 | 9 | 10) {
                    self.phase = GamePhase::Point;
                    self.point = Some(total);
                }
            }
            GamePhase::Point => {
                if total == 7 || Some(total) == self.point {
                    self.phase = GamePhase::ComeOut;
                    self.point = None;
                }
            }
        }
    }

    /// Stake plus winnings at `multiplier`:1
    fn payout(amount: CrapTokens, multiplier: u64) -> Result<CrapTokens> {
        amount
            .amount()
            .checked_mul(multiplier)
            .and_then(|winnings| winnings.checked_add(amount.amount()))
            .map(CrapTokens::new)
            .ok_or_else(|| Error::ArithmeticOverflow("Payout overflow".to_string()))
    }

    fn roll_effect(bet_type: BetType, phase: GamePhase, point: Option<u8>, roll: DiceRoll) -> RollEffect {
        let total = roll.total();
        match bet_type {
            BetType::Pass => match phase {
                GamePhase::ComeOut if roll.is_natural() => RollEffect::Win(1),
                GamePhase::ComeOut if roll.is_craps() => RollEffect::Lose,
                GamePhase::ComeOut => RollEffect::Stay,
                GamePhase::Point if Some(total) == point => RollEffect::Win(1),
                GamePhase::Point if total == 7 => RollEffect::Lose,
                GamePhase::Point => RollEffect::Stay,
            },
            BetType::DontPass => match phase {
                // Bar 12
                GamePhase::ComeOut if total == 12 => RollEffect::Push,
                GamePhase::ComeOut if roll.is_craps() => RollEffect::Win(1),
                GamePhase::ComeOut if roll.is_natural() => RollEffect::Lose,
                GamePhase::ComeOut => RollEffect::Stay,
                GamePhase::Point if total == 7 => RollEffect::Win(1),
                GamePhase::Point if Some(total) == point => RollEffect::Lose,
                GamePhase::Point => RollEffect::Stay,
            },
            BetType::Field => match total {
                2 | 12 => RollEffect::Win(2),
                3 | 4 | 9 | 10 | 11 => RollEffect::Win(1),
                _ => RollEffect::Lose,
            },
            BetType::Any7 => {
                if total == 7 {
                    RollEffect::Win(4)
                } else {
                    RollEffect::Lose
                }
            }
            BetType::AnyCraps => {
                if roll.is_craps() {
                    RollEffect::Win(7)
                } else {
                    RollEffect::Lose
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet(player: u8, bet_type: BetType, amount: u64) -> Bet {
        Bet {
            player: [player; 32],
            bet_type,
            amount: CrapTokens::new(amount),
        }
    }

    fn roll(a: u8, b: u8) -> DiceRoll {
        DiceRoll::new(a, b).unwrap()
    }

    #[test]
    fn test_pass_line_natural() {
        let mut game = CrapsGame::new([1; 16]);
        game.place_bet(bet(1, BetType::Pass, 100)).unwrap();
        game.place_bet(bet(2, BetType::DontPass, 50)).unwrap();

        let resolutions = game.process_roll(roll(3, 4), 1).unwrap();
        assert_eq!(resolutions.len(), 2);
        let pass = resolutions.iter().find(|r| r.bet_type() == BetType::Pass).unwrap();
        assert_eq!(pass.returned_to_player(), CrapTokens::new(200));
        let dont = resolutions.iter().find(|r| r.bet_type() == BetType::DontPass).unwrap();
        assert!(dont.is_loss());
        assert_eq!(game.phase, GamePhase::ComeOut);
        assert!(game.bets.is_empty());
        assert_eq!(game.last_round_id, Some(1));
    }

    #[test]
    fn test_point_cycle() {
        let mut game = CrapsGame::new([1; 16]);
        game.place_bet(bet(1, BetType::Pass, 10)).unwrap();

        assert!(game.process_roll(roll(2, 4), 1).unwrap().is_empty());
        assert_eq!(game.phase, GamePhase::Point);
        assert_eq!(game.point, Some(6));
        assert!(game.place_bet(bet(2, BetType::Pass, 10)).is_err());
        assert!(game.place_bet(bet(2, BetType::Field, 10)).is_ok());

        // 5 loses the field bet, pass stays
        let resolutions = game.process_roll(roll(1, 4), 2).unwrap();
        assert_eq!(resolutions.len(), 1);
        assert!(resolutions[0].is_loss());

        let resolutions = game.process_roll(roll(3, 3), 3).unwrap();
        assert!(resolutions[0].is_win());
        assert_eq!(game.phase, GamePhase::ComeOut);
        assert_eq!(game.point, None);
        assert_eq!(game.roll_count, 3);
    }

    #[test]
    fn test_dont_pass_bar_twelve() {
        let mut game = CrapsGame::new([1; 16]);
        game.place_bet(bet(1, BetType::DontPass, 40)).unwrap();
        let resolutions = game.process_roll(roll(6, 6), 1).unwrap();
        assert!(resolutions[0].is_push());
        assert_eq!(resolutions[0].returned_to_player(), CrapTokens::new(40));
    }

    #[test]
    fn test_proposition_payouts() {
        let mut game = CrapsGame::new([1; 16]);
        game.place_bet(bet(1, BetType::AnyCraps, 10)).unwrap();
        game.place_bet(bet(1, BetType::Field, 10)).unwrap();
        game.place_bet(bet(2, BetType::Any7, 10)).unwrap();

        let resolutions = game.process_roll(roll(1, 1), 1).unwrap();
        let payout = |t: BetType| {
            resolutions
                .iter()
                .find(|r| r.bet_type() == t)
                .map(|r| r.returned_to_player())
                .unwrap()
        };
        assert_eq!(payout(BetType::AnyCraps), CrapTokens::new(80));
        assert_eq!(payout(BetType::Field), CrapTokens::new(30));
        assert_eq!(payout(BetType::Any7), CrapTokens::default());
    }

    #[test]
    fn test_repeat_bet_merges() {
        let mut game = CrapsGame::new([1; 16]);
        game.place_bet(bet(1, BetType::Field, 10)).unwrap();
        game.place_bet(bet(1, BetType::Field, 15)).unwrap();
        assert_eq!(game.total_escrowed(), 25);
        let removed = game.remove_bet(&[1; 32], BetType::Field).unwrap();
        assert_eq!(removed.amount, CrapTokens::new(25));
        assert!(game.bets.is_empty());
    }
}
