//! Threaded reply engine.
//!
//! A partially loaded tree of replies hanging off one opinion, kept in sync
//! with a paginated remote API:
//!
//! - [`TreeCache`]: flat arena of nodes plus ordered id lists
//! - [`PaginationController`]: page cursors and the single-flight guard
//! - [`VoteReconciler`]: optimistic upvotes with rollback
//! - [`SortController`]: active sort key
//! - [`router`]: folds create/delete/vote results into the cache
//! - [`ReplyThread`]: ties them together for one open thread view
//!
//! Replies nest at most three levels (depths 0, 1 and 2).

mod cache;
mod engine;
mod error;
mod model;
mod pagination;
pub mod router;
mod sort;
mod votes;

pub use cache::{DeleteEffect, TreeCache};
pub use engine::{Dispatch, EventOutcome, ReplyThread, ThreadEvent, ThreadSettings, MAX_REPLY_LENGTH};
pub use error::{ReplyError, ValidationError};
pub use model::{
    Author, Depth, DepthOutOfRange, Page, ReplyId, ReplyNode, SortKey, UnknownSortKey, VoteSnapshot,
    DELETED_PLACEHOLDER,
};
pub use pagination::{FetchScope, PaginationController, CHILD_PAGE_SIZE, MAX_PAGE_SIZE, TOP_LEVEL_PAGE_SIZE};
pub use sort::SortController;
pub use votes::{VotePhase, VoteReconciler};
