//! Value types for a single reply and the pages the remote API returns.
//!
//! Nodes are plain data. All mutation rules live in [`super::cache::TreeCache`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder rendered in place of a tombstoned reply's content.
pub const DELETED_PLACEHOLDER: &str = "[deleted]";

// ============================================================================
// Identity
// ============================================================================

/// Opaque reply identity, unique across the whole tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyId(String);

impl ReplyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Depth
// ============================================================================

/// Nesting level of a reply: 0 (attached to the opinion), 1 or 2.
///
/// Depth is fixed when the node is created and never recomputed from its
/// position in the tree. Depth-2 replies are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Depth(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Reply depth {0} exceeds the maximum of {max}", max = Depth::MAX.0)]
pub struct DepthOutOfRange(pub u8);

impl Depth {
    pub const TOP: Depth = Depth(0);
    pub const MAX: Depth = Depth(2);

    pub fn new(level: u8) -> Result<Self, DepthOutOfRange> {
        if level > Self::MAX.0 {
            return Err(DepthOutOfRange(level));
        }
        Ok(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Whether a reply at this depth may itself be replied to.
    pub fn accepts_replies(self) -> bool {
        self < Self::MAX
    }

    /// Depth of a direct child, or `None` at the cap.
    pub fn child(self) -> Option<Depth> {
        Depth::new(self.0 + 1).ok()
    }
}

impl TryFrom<u8> for Depth {
    type Error = DepthOutOfRange;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Depth::new(level)
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Sort Key
// ============================================================================

/// Ordering requested from the server for both top-level and child pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Best,
    Top,
    Controversial,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown sort key '{0}' (expected best, top, controversial or date)")]
pub struct UnknownSortKey(pub String);

impl SortKey {
    pub const ALL: [SortKey; 4] = [
        SortKey::Best,
        SortKey::Top,
        SortKey::Controversial,
        SortKey::Date,
    ];

    /// Wire name, also used as the `sort` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Best => "best",
            SortKey::Top => "top",
            SortKey::Controversial => "controversial",
            SortKey::Date => "date",
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = UnknownSortKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SortKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSortKey(s.to_string()))
    }
}

// ============================================================================
// Reply Node
// ============================================================================

/// Denormalized author snapshot carried on every reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// The current user's vote on a reply, as shown or as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteSnapshot {
    pub upvoted: bool,
    pub upvote_count: u32,
}

impl VoteSnapshot {
    /// The locally predicted result of flipping this vote.
    pub fn toggled(self) -> Self {
        let upvoted = !self.upvoted;
        let upvote_count = if upvoted {
            self.upvote_count.saturating_add(1)
        } else {
            self.upvote_count.saturating_sub(1)
        };
        Self {
            upvoted,
            upvote_count,
        }
    }
}

/// A single reply in an opinion's discussion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyNode {
    pub id: ReplyId,
    /// `None` for top-level replies.
    pub parent_id: Option<ReplyId>,
    pub depth: Depth,
    pub content: String,
    /// Tombstone flag: content is cleared and the node is no longer actionable.
    pub is_deleted: bool,
    pub author: Author,
    pub created_at: DateTime<Utc>,
    pub is_edited: bool,
    pub upvoted: bool,
    pub upvote_count: u32,
    /// Server-reported number of direct children, independent of how many are loaded.
    pub child_count: u32,
    /// Whether the current user may delete this reply.
    pub is_owner: bool,
}

impl ReplyNode {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn can_reply(&self) -> bool {
        !self.is_deleted && self.depth.accepts_replies()
    }

    pub fn vote(&self) -> VoteSnapshot {
        VoteSnapshot {
            upvoted: self.upvoted,
            upvote_count: self.upvote_count,
        }
    }

    pub fn set_vote(&mut self, vote: VoteSnapshot) {
        self.upvoted = vote.upvoted;
        self.upvote_count = vote.upvote_count;
    }

    /// Text to display: the content, or the placeholder for tombstones.
    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content
        }
    }
}

/// One page of replies from either pagination scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<ReplyNode>,
    pub has_next_page: bool,
}
