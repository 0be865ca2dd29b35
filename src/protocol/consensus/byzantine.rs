//! Advisory detection of suspicious voting patterns
//!
//! Nothing here blocks finalization. Alerts are logged at warn level, at most
//! once per proposal and kind, and kept in a bounded ring so operators and
//! tests can inspect them.
//!
//! Skew is checked after every vote. Participation is checked when a proposal
//! is decided or expires, since any earlier tally is partial.

use std::collections::{HashSet, VecDeque};

use crate::protocol::{short_hex, PeerId};

use super::voting::VoteTracker;
use super::{participation_threshold, ProposalId};

const MAX_ALERTS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByzantineAlert {
    /// Fewer than the configured share of participants voted on a decided proposal
    LowParticipation {
        proposal_id: ProposalId,
        voted: usize,
        participants: usize,
    },
    /// One side holds more than the configured share of the votes
    VoteSkew {
        proposal_id: ProposalId,
        votes_for: usize,
        votes_against: usize,
    },
    /// A participant signed two different votes on one proposal
    Equivocation {
        proposal_id: ProposalId,
        voter: PeerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertKind {
    LowParticipation,
    VoteSkew,
}

pub struct VotingPatternDetector {
    low_participation_percent: usize,
    vote_skew_percent: usize,
    alerts: VecDeque<ByzantineAlert>,
    raised: HashSet<(ProposalId, AlertKind)>,
    total_raised: u64,
}

impl VotingPatternDetector {
    pub fn new(low_participation_percent: u8, vote_skew_percent: u8) -> Self {
        Self {
            low_participation_percent: usize::from(low_participation_percent),
            vote_skew_percent: usize::from(vote_skew_percent),
            alerts: VecDeque::new(),
            raised: HashSet::new(),
            total_raised: 0,
        }
    }

    /// Check for skew after a vote lands. Only looked at once enough votes
    /// are in for the ratio to mean anything.
    pub fn observe_vote(&mut self, tracker: &VoteTracker, participants: usize) -> Option<ByzantineAlert> {
        let decided = tracker.approvals() + tracker.rejections();
        if decided == 0 || tracker.total_votes() < participation_threshold(participants).max(1) {
            return None;
        }
        let majority = tracker.approvals().max(tracker.rejections());
        // Integer form of majority / decided > skew%
        if majority * 100 <= decided * self.vote_skew_percent || decided < 2 {
            return None;
        }
        self.raise(
            tracker.proposal_id,
            Some(AlertKind::VoteSkew),
            ByzantineAlert::VoteSkew {
                proposal_id: tracker.proposal_id,
                votes_for: tracker.approvals(),
                votes_against: tracker.rejections(),
            },
        )
    }

    /// Check participation once a proposal is decided or expires
    pub fn observe_decision(&mut self, tracker: &VoteTracker, participants: usize) -> Option<ByzantineAlert> {
        let voted = tracker.total_votes();
        if participants == 0 || voted * 100 >= participants * self.low_participation_percent {
            return None;
        }
        self.raise(
            tracker.proposal_id,
            Some(AlertKind::LowParticipation),
            ByzantineAlert::LowParticipation {
                proposal_id: tracker.proposal_id,
                voted,
                participants,
            },
        )
    }

    pub fn record_equivocation(&mut self, proposal_id: ProposalId, voter: PeerId) -> Option<ByzantineAlert> {
        self.raise(proposal_id, None, ByzantineAlert::Equivocation { proposal_id, voter })
    }

    fn raise(
        &mut self,
        proposal_id: ProposalId,
        kind: Option<AlertKind>,
        alert: ByzantineAlert,
    ) -> Option<ByzantineAlert> {
        if let Some(kind) = kind {
            if !self.raised.insert((proposal_id, kind)) {
                return None;
            }
        }
        log::warn!("Byzantine alert on proposal {}: {:?}", short_hex(&proposal_id), alert);
        if self.alerts.len() == MAX_ALERTS {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert.clone());
        self.total_raised += 1;
        Some(alert)
    }

    /// Forget per-proposal dedup state for a decided proposal
    pub fn forget(&mut self, proposal_id: &ProposalId) {
        self.raised.retain(|(id, _)| id != proposal_id);
    }

    pub fn alerts(&self) -> impl Iterator<Item = &ByzantineAlert> {
        self.alerts.iter()
    }

    pub fn total_raised(&self) -> u64 {
        self.total_raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::consensus::voting::VoteChoice;

    #[test]
    fn test_skew_alert_once() {
        let mut detector = VotingPatternDetector::new(50, 90);
        let mut tracker = VoteTracker::new([1; 32]);
        for i in 0..4u8 {
            tracker.record([i; 32], VoteChoice::Approve).unwrap();
        }
        assert!(matches!(
            detector.observe_vote(&tracker, 4),
            Some(ByzantineAlert::VoteSkew { votes_for: 4, .. })
        ));
        assert!(detector.observe_vote(&tracker, 4).is_none());
        assert_eq!(detector.total_raised(), 1);
    }

    #[test]
    fn test_balanced_votes_no_skew() {
        let mut detector = VotingPatternDetector::new(50, 90);
        let mut tracker = VoteTracker::new([1; 32]);
        tracker.record([1; 32], VoteChoice::Approve).unwrap();
        tracker.record([2; 32], VoteChoice::Approve).unwrap();
        tracker.record([3; 32], VoteChoice::Reject).unwrap();
        assert!(detector.observe_vote(&tracker, 4).is_none());
    }

    #[test]
    fn test_low_participation() {
        let mut detector = VotingPatternDetector::new(50, 90);
        let mut tracker = VoteTracker::new([1; 32]);
        tracker.record([1; 32], VoteChoice::Approve).unwrap();
        assert!(detector.observe_decision(&tracker, 4).is_some());

        tracker.record([2; 32], VoteChoice::Approve).unwrap();
        let mut fresh = VotingPatternDetector::new(50, 90);
        assert!(fresh.observe_decision(&tracker, 4).is_none());
    }

    #[test]
    fn test_participation_judged_at_decision() {
        let mut detector = VotingPatternDetector::new(50, 90);
        let mut tracker = VoteTracker::new([1; 32]);
        tracker.record([1; 32], VoteChoice::Approve).unwrap();
        // A single early vote is not a participation problem yet
        assert!(detector.observe_vote(&tracker, 4).is_none());
        assert_eq!(detector.total_raised(), 0);
        assert!(matches!(
            detector.observe_decision(&tracker, 4),
            Some(ByzantineAlert::LowParticipation { voted: 1, participants: 4, .. })
        ));
    }

    #[test]
    fn test_equivocation_always_recorded() {
        let mut detector = VotingPatternDetector::new(50, 90);
        assert!(detector.record_equivocation([1; 32], [2; 32]).is_some());
        assert!(detector.record_equivocation([1; 32], [2; 32]).is_some());
        assert_eq!(detector.alerts().count(), 2);
    }
}
