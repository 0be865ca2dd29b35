//! Vote tracking for proposals

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::SystemTime;

use crate::crypto::{hash_parts, verify_signature, SigningKeyPair};
use crate::error::{Error, Result};
use crate::protocol::{short_hex, PeerId, Signature};

use super::ProposalId;

/// A participant's position on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

impl VoteChoice {
    fn tag(&self) -> u8 {
        match self {
            VoteChoice::Approve => 1,
            VoteChoice::Reject => 2,
            VoteChoice::Abstain => 3,
        }
    }
}

/// Vote as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVote {
    pub proposal_id: ProposalId,
    pub voter: PeerId,
    pub choice: VoteChoice,
    pub signature: Signature,
}

impl SignedVote {
    pub fn new(keys: &SigningKeyPair, proposal_id: ProposalId, choice: VoteChoice) -> Self {
        let voter = keys.peer_id();
        let signature = keys.sign(&Self::signing_payload(&proposal_id, &voter, choice));
        Self {
            proposal_id,
            voter,
            choice,
            signature,
        }
    }

    fn signing_payload(proposal_id: &ProposalId, voter: &PeerId, choice: VoteChoice) -> [u8; 32] {
        hash_parts(b"BITCRAPS_VOTE", &[proposal_id, voter, &[choice.tag()]])
    }

    pub fn verify(&self) -> bool {
        verify_signature(
            &self.voter,
            &Self::signing_payload(&self.proposal_id, &self.voter, self.choice),
            &self.signature,
        )
    }
}

/// Vote tracking for proposals
///
/// A participant lands in at most one of the three sets. A second vote is
/// refused even when it repeats the first choice.
#[derive(Debug, Clone)]
pub struct VoteTracker {
    pub proposal_id: ProposalId,
    pub votes_for: HashSet<PeerId>,
    pub votes_against: HashSet<PeerId>,
    pub abstentions: HashSet<PeerId>,
    pub created_at: SystemTime,
}

impl VoteTracker {
    pub fn new(proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            votes_for: HashSet::new(),
            votes_against: HashSet::new(),
            abstentions: HashSet::new(),
            created_at: SystemTime::now(),
        }
    }

    /// The choice a voter already made, if any
    pub fn choice_of(&self, voter: &PeerId) -> Option<VoteChoice> {
        if self.votes_for.contains(voter) {
            Some(VoteChoice::Approve)
        } else if self.votes_against.contains(voter) {
            Some(VoteChoice::Reject)
        } else if self.abstentions.contains(voter) {
            Some(VoteChoice::Abstain)
        } else {
            None
        }
    }

    pub fn has_voted(&self, voter: &PeerId) -> bool {
        self.choice_of(voter).is_some()
    }

    /// Record a vote exactly once
    pub fn record(&mut self, voter: PeerId, choice: VoteChoice) -> Result<()> {
        if let Some(previous) = self.choice_of(&voter) {
            return Err(Error::DuplicateVote(format!(
                "{} already voted {:?} on proposal {}",
                short_hex(&voter),
                previous,
                short_hex(&self.proposal_id)
            )));
        }
        match choice {
            VoteChoice::Approve => self.votes_for.insert(voter),
            VoteChoice::Reject => self.votes_against.insert(voter),
            VoteChoice::Abstain => self.abstentions.insert(voter),
        };
        Ok(())
    }

    /// Get total votes cast
    pub fn total_votes(&self) -> usize {
        self.votes_for.len() + self.votes_against.len() + self.abstentions.len()
    }

    pub fn approvals(&self) -> usize {
        self.votes_for.len()
    }

    pub fn rejections(&self) -> usize {
        self.votes_against.len()
    }
}
