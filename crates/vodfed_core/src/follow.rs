/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Follow edge lifecycle. An edge is a directed subscription
//! `(follower -> following)` and moves through an explicit state machine;
//! only `accepted` edges count toward stats or delivery fan-out.

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Pending,
    Accepted,
    Rejected,
}

impl FollowState {
    pub fn as_i64(self) -> i64 {
        match self {
            FollowState::Pending => 0,
            FollowState::Accepted => 1,
            FollowState::Rejected => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(FollowState::Pending),
            1 => Some(FollowState::Accepted),
            2 => Some(FollowState::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FollowState::Pending => "pending",
            FollowState::Accepted => "accepted",
            FollowState::Rejected => "rejected",
        }
    }

    /// Transition table. Accept/reject leave `pending` exactly once; an
    /// accepted edge may be soft-removed to `rejected` (unfollow). Edges are
    /// never hard-deleted.
    pub fn can_transition(self, to: FollowState) -> bool {
        matches!(
            (self, to),
            (FollowState::Pending, FollowState::Accepted)
                | (FollowState::Pending, FollowState::Rejected)
                | (FollowState::Accepted, FollowState::Rejected)
        )
    }

    pub fn check_transition(self, to: FollowState) -> EngineResult<()> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(EngineError::InvalidStateTransition {
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}
