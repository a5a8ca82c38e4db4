//! Optimistic upvote toggling with per-reply single-flight.
//!
//! Each reply moves `Idle -> Pending -> {Confirmed, RolledBack} -> Idle`.
//! Entering `Pending` applies the predicted vote to the cache at once;
//! confirmation overwrites it with whatever the server reports, and failure
//! restores the exact pre-toggle values.

use super::cache::TreeCache;
use super::model::{ReplyId, VoteSnapshot};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotePhase {
    Idle,
    Pending,
    /// The server's values were applied. Transient: the reply is Idle again.
    Confirmed,
    /// The pre-toggle values were restored. Transient: the reply is Idle again.
    RolledBack,
}

#[derive(Debug, Clone, Copy)]
struct PendingVote {
    before: VoteSnapshot,
    optimistic: VoteSnapshot,
}

#[derive(Debug, Default)]
pub struct VoteReconciler {
    pending: HashMap<ReplyId, PendingVote>,
}

impl VoteReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, id: &ReplyId) -> VotePhase {
        if self.pending.contains_key(id) {
            VotePhase::Pending
        } else {
            VotePhase::Idle
        }
    }

    pub fn is_pending(&self, id: &ReplyId) -> bool {
        self.pending.contains_key(id)
    }

    /// The value currently shown for a pending vote.
    pub fn optimistic(&self, id: &ReplyId) -> Option<VoteSnapshot> {
        self.pending.get(id).map(|p| p.optimistic)
    }

    /// `Idle -> Pending`. Applies the predicted vote and returns it.
    ///
    /// Returns `None` without touching anything if a vote on `id` is already
    /// pending or the reply is not in the tree.
    pub fn begin(&mut self, cache: &mut TreeCache, id: &ReplyId) -> Option<VoteSnapshot> {
        if self.pending.contains_key(id) {
            tracing::debug!(reply_id = %id, "Vote already pending, rejecting toggle");
            return None;
        }
        let before = cache.get(id)?.vote();
        let optimistic = before.toggled();
        cache.apply_vote(id, optimistic.upvoted, optimistic.upvote_count);
        self.pending
            .insert(id.clone(), PendingVote { before, optimistic });
        tracing::debug!(
            reply_id = %id,
            upvoted = optimistic.upvoted,
            count = optimistic.upvote_count,
            "Applied optimistic vote"
        );
        Some(optimistic)
    }

    /// `Pending -> Confirmed -> Idle`. The server's values win, even when
    /// they differ from the prediction.
    pub fn confirm(&mut self, cache: &mut TreeCache, id: &ReplyId, server: VoteSnapshot) -> VotePhase {
        let Some(pending) = self.pending.remove(id) else {
            return VotePhase::Idle;
        };
        if pending.optimistic != server {
            tracing::debug!(
                reply_id = %id,
                predicted = pending.optimistic.upvote_count,
                actual = server.upvote_count,
                "Server vote differs from prediction"
            );
        }
        cache.apply_vote(id, server.upvoted, server.upvote_count);
        VotePhase::Confirmed
    }

    /// `Pending -> RolledBack -> Idle`. Restores the pre-toggle values.
    pub fn roll_back(&mut self, cache: &mut TreeCache, id: &ReplyId) -> VotePhase {
        let Some(pending) = self.pending.remove(id) else {
            return VotePhase::Idle;
        };
        tracing::warn!(reply_id = %id, "Vote failed, rolling back");
        cache.apply_vote(id, pending.before.upvoted, pending.before.upvote_count);
        VotePhase::RolledBack
    }
}
