//! Page cursors for the two pagination scopes and the single-flight guard
//! that keeps identical fetches from being issued twice.

use super::model::{ReplyId, SortKey};
use std::collections::{HashMap, HashSet};

/// Default page size for replies attached directly to the opinion.
pub const TOP_LEVEL_PAGE_SIZE: u32 = 20;
/// Default page size for the children of one reply.
pub const CHILD_PAGE_SIZE: u32 = 50;
/// Upper bound accepted from configuration for either page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Identity of one fetch. Two requests with equal scopes are duplicates.
///
/// Both scopes carry the sort key so a fetch under a new order is not
/// mistaken for an outstanding request of the previous one, whose result
/// will be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchScope {
    TopLevel { page: u32, sort: SortKey },
    Children { parent: ReplyId, page: u32, sort: SortKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageCursor {
    next_page: u32,
    has_more: bool,
}

impl PageCursor {
    const FIRST: PageCursor = PageCursor {
        next_page: 1,
        has_more: true,
    };
}

#[derive(Debug)]
pub struct PaginationController {
    top_level_page_size: u32,
    child_page_size: u32,
    top_level: PageCursor,
    children: HashMap<ReplyId, PageCursor>,
    in_flight: HashSet<FetchScope>,
}

impl Default for PaginationController {
    fn default() -> Self {
        Self::new(TOP_LEVEL_PAGE_SIZE, CHILD_PAGE_SIZE)
    }
}

impl PaginationController {
    /// Page sizes are clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(top_level_page_size: u32, child_page_size: u32) -> Self {
        Self {
            top_level_page_size: top_level_page_size.clamp(1, MAX_PAGE_SIZE),
            child_page_size: child_page_size.clamp(1, MAX_PAGE_SIZE),
            top_level: PageCursor::FIRST,
            children: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn top_level_page_size(&self) -> u32 {
        self.top_level_page_size
    }

    pub fn child_page_size(&self) -> u32 {
        self.child_page_size
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// The next top-level page to request, or `None` once the server said
    /// there are no more.
    pub fn next_top_level(&self, sort: SortKey) -> Option<FetchScope> {
        self.top_level.has_more.then_some(FetchScope::TopLevel {
            page: self.top_level.next_page,
            sort,
        })
    }

    /// The follow-up child page for `parent`, if its first page was loaded
    /// and reported more.
    pub fn next_children(&self, parent: &ReplyId, sort: SortKey) -> Option<FetchScope> {
        let cursor = self.children.get(parent)?;
        cursor.has_more.then(|| FetchScope::Children {
            parent: parent.clone(),
            page: cursor.next_page,
            sort,
        })
    }

    pub fn has_more_top_level(&self) -> bool {
        self.top_level.has_more
    }

    pub fn has_more_children(&self, parent: &ReplyId) -> bool {
        self.children.get(parent).is_some_and(|c| c.has_more)
    }

    // ========================================================================
    // Single-flight guard
    // ========================================================================

    /// Claims `scope`. Returns false if an identical fetch is outstanding.
    pub fn begin(&mut self, scope: &FetchScope) -> bool {
        self.in_flight.insert(scope.clone())
    }

    /// Releases `scope` once its result (or failure) has arrived.
    pub fn finish(&mut self, scope: &FetchScope) {
        self.in_flight.remove(scope);
    }

    pub fn is_in_flight(&self, scope: &FetchScope) -> bool {
        self.in_flight.contains(scope)
    }

    pub fn is_loading_top_level(&self, sort: SortKey) -> bool {
        self.in_flight
            .iter()
            .any(|scope| matches!(scope, FetchScope::TopLevel { sort: s, .. } if *s == sort))
    }

    pub fn is_loading_children(&self, parent: &ReplyId, sort: SortKey) -> bool {
        self.in_flight.iter().any(|scope| {
            matches!(scope, FetchScope::Children { parent: p, sort: s, .. } if p == parent && *s == sort)
        })
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Whether a top-level page still lines up with the cursor. A page from
    /// before a reset (or a duplicate) does not.
    pub fn accepts_top_level(&self, page: u32) -> bool {
        page == self.top_level.next_page
    }

    pub fn record_top_level(&mut self, page: u32, has_more: bool) {
        self.top_level = PageCursor {
            next_page: page.saturating_add(1),
            has_more,
        };
    }

    /// Back to page 1, used on sort change and refresh.
    pub fn reset_top_level(&mut self) {
        self.top_level = PageCursor::FIRST;
    }

    /// First pages always apply (they replace the list); later pages only
    /// when they are the one the cursor expects.
    pub fn accepts_children(&self, parent: &ReplyId, page: u32) -> bool {
        page == 1 || self.children.get(parent).is_some_and(|c| c.next_page == page)
    }

    pub fn record_children(&mut self, parent: &ReplyId, page: u32, has_more: bool) {
        self.children.insert(
            parent.clone(),
            PageCursor {
                next_page: page.saturating_add(1),
                has_more,
            },
        );
    }

    /// Drops the cursor of a reply that left the tree.
    pub fn forget_children(&mut self, parent: &ReplyId) {
        self.children.remove(parent);
    }
}
