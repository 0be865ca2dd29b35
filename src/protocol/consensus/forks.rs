//! Canonical chain tracking and fork choice
//!
//! Fork choice is total: more confirmations after the fork point wins, then
//! the earlier finalizing timestamp, then the lexicographically smaller state
//! hash. Every peer holding the same two branches picks the same winner.

use rustc_hash::FxHashMap;
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::protocol::short_hex;

use super::engine::GameOperation;
use super::{ProposalId, StateHash};

/// One finalized step of a chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub state_hash: StateHash,
    pub previous_state_hash: StateHash,
    pub sequence_number: u64,
    pub confirmations: u32,
    pub timestamp: u64,
    pub proposal_id: Option<ProposalId>,
    pub operation: Option<GameOperation>,
}

impl ChainLink {
    pub fn genesis(state_hash: StateHash, timestamp: u64) -> Self {
        Self {
            state_hash,
            previous_state_hash: [0u8; 32],
            sequence_number: 0,
            confirmations: 0,
            timestamp,
            proposal_id: None,
            operation: None,
        }
    }
}

/// Competing branch rooted in the canonical chain
#[derive(Debug, Clone)]
pub struct Fork {
    /// Canonical state both branches build on
    pub fork_point: StateHash,
    pub competing: ChainLink,
    pub detected_at: u64,
    pub resolution: Option<ForkResolution>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkResolution {
    pub winner: StateHash,
    pub loser: StateHash,
    /// True when the competing branch replaced the canonical one
    pub adopted: bool,
    /// Canonical links discarded by adoption, oldest first
    pub orphaned: Vec<ChainLink>,
}

/// Summary of one branch used by fork choice
#[derive(Debug, Clone, Copy)]
struct BranchWeight {
    confirmations: u64,
    timestamp: u64,
    tip: StateHash,
}

fn fork_choice(canonical: &BranchWeight, competing: &BranchWeight) -> Ordering {
    // Greater means canonical wins
    canonical
        .confirmations
        .cmp(&competing.confirmations)
        .then_with(|| competing.timestamp.cmp(&canonical.timestamp))
        .then_with(|| competing.tip.cmp(&canonical.tip))
}

/// Canonical chain pointer plus known forks
#[derive(Debug, Clone)]
pub struct ForkRegistry {
    canonical: Vec<ChainLink>,
    forks: FxHashMap<StateHash, Fork>,
    max_forks: usize,
}

impl ForkRegistry {
    pub fn new(genesis: ChainLink, max_forks: usize) -> Self {
        Self {
            canonical: vec![genesis],
            forks: FxHashMap::default(),
            max_forks,
        }
    }

    /// Restart the chain from a synced snapshot
    pub fn reset(&mut self, anchor: ChainLink) {
        self.canonical = vec![anchor];
        self.forks.retain(|_, fork| fork.resolution.is_some());
    }

    pub fn push_canonical(&mut self, link: ChainLink) {
        self.canonical.push(link);
    }

    pub fn head(&self) -> Option<&ChainLink> {
        self.canonical.last()
    }

    pub fn canonical_chain(&self) -> &[ChainLink] {
        &self.canonical
    }

    pub fn contains(&self, state_hash: &StateHash) -> bool {
        self.canonical.iter().any(|link| &link.state_hash == state_hash)
    }

    fn position(&self, state_hash: &StateHash) -> Option<usize> {
        self.canonical.iter().position(|link| &link.state_hash == state_hash)
    }

    /// Register a competing link whose parent is on the canonical chain
    pub fn register_fork(&mut self, competing: ChainLink, now: u64) -> Result<&Fork> {
        let fork_point = competing.previous_state_hash;
        let Some(index) = self.position(&fork_point) else {
            return Err(Error::InvalidState(format!(
                "fork parent {} is not on the canonical chain",
                short_hex(&fork_point)
            )));
        };
        if index + 1 == self.canonical.len() {
            return Err(Error::InvalidState(
                "competing link extends the head, not a fork".to_string(),
            ));
        }
        let unresolved = self.unresolved_count();
        let fork_id = competing.state_hash;
        if !self.forks.contains_key(&fork_id) && unresolved >= self.max_forks {
            return Err(Error::ResourceExhausted(format!(
                "{} unresolved forks already tracked",
                unresolved
            )));
        }
        log::warn!(
            "Fork detected at sequence {}: {} competes with canonical {}",
            competing.sequence_number,
            short_hex(&competing.state_hash),
            short_hex(&self.canonical[index + 1].state_hash)
        );
        Ok(self.forks.entry(fork_id).or_insert(Fork {
            fork_point,
            competing,
            detected_at: now,
            resolution: None,
        }))
    }

    /// Decide a registered fork. Adoption truncates the canonical chain at the
    /// fork point and appends the competing link.
    pub fn resolve(&mut self, fork_id: &StateHash) -> Result<ForkResolution> {
        let fork = self
            .forks
            .get(fork_id)
            .ok_or_else(|| Error::InvalidState(format!("unknown fork {}", short_hex(fork_id))))?;
        if let Some(resolution) = &fork.resolution {
            return Ok(resolution.clone());
        }
        let index = self.position(&fork.fork_point).ok_or_else(|| {
            Error::InvalidState(format!("fork point {} left the chain", short_hex(&fork.fork_point)))
        })?;

        let after = &self.canonical[index + 1..];
        let canonical_weight = BranchWeight {
            confirmations: after.iter().map(|link| u64::from(link.confirmations)).sum(),
            timestamp: after.first().map(|link| link.timestamp).unwrap_or(u64::MAX),
            tip: after.first().map(|link| link.state_hash).unwrap_or([0xFF; 32]),
        };
        let competing_weight = BranchWeight {
            confirmations: u64::from(fork.competing.confirmations),
            timestamp: fork.competing.timestamp,
            tip: fork.competing.state_hash,
        };

        let competing = fork.competing.clone();
        let resolution = match fork_choice(&canonical_weight, &competing_weight) {
            Ordering::Less => {
                let orphaned = self.canonical.split_off(index + 1);
                self.canonical.push(competing.clone());
                ForkResolution {
                    winner: competing.state_hash,
                    loser: canonical_weight.tip,
                    adopted: true,
                    orphaned,
                }
            }
            _ => ForkResolution {
                winner: canonical_weight.tip,
                loser: competing.state_hash,
                adopted: false,
                orphaned: Vec::new(),
            },
        };
        log::info!(
            "Fork resolved: {} wins over {} ({} canonical links orphaned)",
            short_hex(&resolution.winner),
            short_hex(&resolution.loser),
            resolution.orphaned.len()
        );

        if let Some(fork) = self.forks.get_mut(fork_id) {
            fork.resolution = Some(resolution.clone());
        }
        Ok(resolution)
    }

    /// Drop a fork that cannot be evaluated locally
    pub fn discard(&mut self, fork_id: &StateHash) -> Option<Fork> {
        self.forks.remove(fork_id)
    }

    pub fn get(&self, fork_id: &StateHash) -> Option<&Fork> {
        self.forks.get(fork_id)
    }

    pub fn unresolved_count(&self) -> usize {
        self.forks.values().filter(|fork| fork.resolution.is_none()).count()
    }
}
