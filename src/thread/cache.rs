//! In-memory reply tree for one open thread view.
//!
//! Nodes are stored flat in an arena keyed by [`ReplyId`]; ordering lives in
//! separate id lists (one for the top level, one per parent whose children
//! have been loaded). Every node id sits in exactly one place: the top-level
//! list, one parent's child list, or the detached set left behind by a sort
//! reset until the next page replaces it.
//!
//! All mutators are synchronous, never fail, and never perform I/O. Results
//! that no longer fit the tree (unknown parent, id already placed elsewhere)
//! are dropped and logged instead.

use super::model::{ReplyId, ReplyNode, VoteSnapshot};
use std::collections::{HashMap, HashSet};

/// Where a node currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    TopLevel,
    Child(ReplyId),
    /// Removed from the top-level list by a reset but kept so its child
    /// cache can be reattached if the next page contains it again.
    Detached,
}

#[derive(Debug, Clone)]
struct Entry {
    node: ReplyNode,
    slot: Slot,
}

/// What happened to a reply after the server confirmed its deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteEffect {
    /// Spliced out of its list; the parent's count dropped by one.
    Removed,
    /// Kept in place with its content cleared so its replies stay reachable.
    Tombstoned,
    /// The reply was no longer in the tree.
    Missing,
}

#[derive(Debug, Default)]
pub struct TreeCache {
    nodes: HashMap<ReplyId, Entry>,
    top_level: Vec<ReplyId>,
    children: HashMap<ReplyId, Vec<ReplyId>>,
    /// Parents whose children were fetched from the server at least once.
    fetched: HashSet<ReplyId>,
    expanded: HashSet<ReplyId>,
    /// Parents whose cached children predate the current sort order.
    stale: HashSet<ReplyId>,
    /// Children created locally that no fetched page has listed yet.
    unconfirmed: HashSet<ReplyId>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Read-only view
    // ========================================================================

    pub fn top_level(&self) -> Vec<&ReplyNode> {
        self.resolve(&self.top_level)
    }

    /// Loaded children of `id`, in server order. Empty if none are loaded.
    pub fn children_of(&self, id: &ReplyId) -> Vec<&ReplyNode> {
        self.children
            .get(id)
            .map(|ids| self.resolve(ids))
            .unwrap_or_default()
    }

    pub fn is_expanded(&self, id: &ReplyId) -> bool {
        self.expanded.contains(id)
    }

    pub fn has_fetched_children(&self, id: &ReplyId) -> bool {
        self.fetched.contains(id)
    }

    pub fn is_stale(&self, id: &ReplyId) -> bool {
        self.stale.contains(id)
    }

    /// Looks up a node that is currently part of the visible tree.
    pub fn get(&self, id: &ReplyId) -> Option<&ReplyNode> {
        self.nodes
            .get(id)
            .filter(|entry| entry.slot != Slot::Detached)
            .map(|entry| &entry.node)
    }

    pub fn contains(&self, id: &ReplyId) -> bool {
        self.get(id).is_some()
    }

    /// The parent a node was placed under, or `None` for top-level nodes.
    pub fn parent_of(&self, id: &ReplyId) -> Option<&ReplyId> {
        match &self.nodes.get(id)?.slot {
            Slot::Child(parent) => Some(parent),
            Slot::TopLevel | Slot::Detached => None,
        }
    }

    /// Number of nodes in the visible tree.
    pub fn len(&self) -> usize {
        self.nodes
            .values()
            .filter(|entry| entry.slot != Slot::Detached)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve<'a>(&'a self, ids: &[ReplyId]) -> Vec<&'a ReplyNode> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id).map(|entry| &entry.node))
            .collect()
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Installs a page of top-level replies.
    ///
    /// With `append == false` the page replaces the list; nodes that were
    /// listed (or detached) before and are absent now are dropped together
    /// with their cached subtrees. Ids already in the list are updated in
    /// place rather than duplicated.
    pub fn replace_top_level(&mut self, nodes: Vec<ReplyNode>, append: bool) {
        if !append {
            for id in std::mem::take(&mut self.top_level) {
                if let Some(entry) = self.nodes.get_mut(&id) {
                    entry.slot = Slot::Detached;
                }
            }
        }

        for node in nodes {
            let id = node.id.clone();
            match self.nodes.get_mut(&id) {
                Some(entry) => match entry.slot {
                    Slot::TopLevel => entry.node = node,
                    Slot::Detached => {
                        entry.node = node;
                        entry.slot = Slot::TopLevel;
                        self.top_level.push(id);
                    }
                    Slot::Child(ref parent) => {
                        tracing::warn!(
                            reply_id = %id,
                            parent_id = %parent,
                            "Top-level page contains a reply already placed under a parent, skipping"
                        );
                    }
                },
                None => {
                    self.nodes.insert(
                        id.clone(),
                        Entry {
                            node,
                            slot: Slot::TopLevel,
                        },
                    );
                    self.top_level.push(id);
                }
            }
        }

        if !append {
            self.prune_detached();
        }
    }

    /// Empties the top-level list ahead of a reload under a new sort order.
    ///
    /// Removed nodes stay detached until the next non-appending page lands,
    /// so parents that reappear keep their child cache. Every retained child
    /// list is marked stale.
    pub fn clear_top_level(&mut self) {
        for id in std::mem::take(&mut self.top_level) {
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.slot = Slot::Detached;
            }
        }
        self.stale.extend(self.children.keys().cloned());
    }

    /// Installs a page of children under `parent` and marks it expanded.
    ///
    /// Returns false (and changes nothing) if `parent` is not in the tree.
    /// The parent's `child_count` is left as the server reported it. A
    /// replacing page keeps locally created children it does not list,
    /// after the page's own entries.
    pub fn set_children(&mut self, parent: &ReplyId, nodes: Vec<ReplyNode>, append: bool) -> bool {
        if !self.contains(parent) {
            return false;
        }

        let mut carried = Vec::new();
        let mut list = if append {
            self.children.remove(parent).unwrap_or_default()
        } else {
            let incoming: HashSet<&ReplyId> = nodes.iter().map(|n| &n.id).collect();
            let previous = self.children.remove(parent).unwrap_or_default();
            for id in previous.into_iter().filter(|id| !incoming.contains(id)) {
                if self.unconfirmed.contains(&id) {
                    carried.push(id);
                } else {
                    self.remove_subtree(&id);
                }
            }
            Vec::with_capacity(nodes.len())
        };
        let mut listed: HashSet<ReplyId> = list.iter().cloned().collect();

        for node in nodes {
            let id = node.id.clone();
            match self.nodes.get_mut(&id) {
                Some(entry) => match entry.slot {
                    Slot::Child(ref owner) if owner == parent => {
                        entry.node = node;
                        self.unconfirmed.remove(&id);
                        if listed.insert(id.clone()) {
                            list.push(id);
                        }
                    }
                    Slot::Detached => {
                        entry.node = node;
                        entry.slot = Slot::Child(parent.clone());
                        if listed.insert(id.clone()) {
                            list.push(id);
                        }
                    }
                    Slot::TopLevel | Slot::Child(_) => {
                        tracing::warn!(
                            reply_id = %id,
                            parent_id = %parent,
                            "Child page contains a reply already placed elsewhere, skipping"
                        );
                    }
                },
                None => {
                    self.nodes.insert(
                        id.clone(),
                        Entry {
                            node,
                            slot: Slot::Child(parent.clone()),
                        },
                    );
                    listed.insert(id.clone());
                    list.push(id);
                }
            }
        }

        for id in carried {
            if listed.insert(id.clone()) {
                list.push(id);
            }
        }

        self.children.insert(parent.clone(), list);
        self.fetched.insert(parent.clone());
        self.expanded.insert(parent.clone());
        self.stale.remove(parent);
        true
    }

    /// Places a reply the server just created.
    ///
    /// Top-level replies go to the front of the list. A child is appended to
    /// its parent's list, the parent's `child_count` grows by exactly one and
    /// the parent is forced open so the new reply is visible. Returns false if
    /// the id is already present (the echo is merged in place instead), the
    /// parent is gone, or the parent is at the depth cap.
    pub fn insert_created(&mut self, node: ReplyNode, parent: Option<&ReplyId>) -> bool {
        if let Some(entry) = self.nodes.get_mut(&node.id) {
            if entry.slot != Slot::Detached {
                entry.node = node;
            }
            return false;
        }

        let id = node.id.clone();
        match parent {
            None => {
                self.nodes.insert(
                    id.clone(),
                    Entry {
                        node,
                        slot: Slot::TopLevel,
                    },
                );
                self.top_level.insert(0, id);
            }
            Some(parent) => {
                let Some(owner) = self
                    .nodes
                    .get_mut(parent)
                    .filter(|entry| entry.slot != Slot::Detached)
                else {
                    tracing::debug!(reply_id = %id, parent_id = %parent, "Parent gone, dropping created reply");
                    return false;
                };
                if !owner.node.depth.accepts_replies() {
                    tracing::warn!(reply_id = %id, parent_id = %parent, "Parent is at the depth cap, dropping created reply");
                    return false;
                }
                owner.node.child_count = owner.node.child_count.saturating_add(1);

                self.nodes.insert(
                    id.clone(),
                    Entry {
                        node,
                        slot: Slot::Child(parent.clone()),
                    },
                );
                self.children.entry(parent.clone()).or_default().push(id.clone());
                self.expanded.insert(parent.clone());
                self.unconfirmed.insert(id);
            }
        }
        true
    }

    /// Overwrites the vote state of a node. Returns false if it is unknown.
    pub fn apply_vote(&mut self, id: &ReplyId, upvoted: bool, upvote_count: u32) -> bool {
        match self.nodes.get_mut(id) {
            Some(entry) => {
                entry.node.set_vote(VoteSnapshot {
                    upvoted,
                    upvote_count,
                });
                true
            }
            None => false,
        }
    }

    /// Soft-deletes a node: content cleared, position and counts untouched.
    pub fn tombstone(&mut self, id: &ReplyId) -> bool {
        match self.nodes.get_mut(id) {
            Some(entry) => {
                entry.node.is_deleted = true;
                entry.node.content.clear();
                true
            }
            None => false,
        }
    }

    /// Splices a node (and its cached subtree) out of whichever list holds
    /// it. A child's parent loses exactly one from its `child_count`.
    pub fn remove_node(&mut self, id: &ReplyId) -> Option<ReplyNode> {
        let slot = self.nodes.get(id)?.slot.clone();
        match slot {
            Slot::TopLevel => self.top_level.retain(|other| other != id),
            Slot::Child(parent) => {
                if let Some(list) = self.children.get_mut(&parent) {
                    list.retain(|other| other != id);
                }
                if let Some(owner) = self.nodes.get_mut(&parent) {
                    owner.node.child_count = owner.node.child_count.saturating_sub(1);
                }
            }
            Slot::Detached => {}
        }
        self.remove_subtree(id)
    }

    /// Applies a confirmed deletion: replies with children are tombstoned,
    /// leaves are removed.
    pub fn delete(&mut self, id: &ReplyId) -> DeleteEffect {
        let Some(node) = self.get(id) else {
            return DeleteEffect::Missing;
        };
        let has_replies =
            node.child_count > 0 || self.children.get(id).is_some_and(|ids| !ids.is_empty());
        if has_replies {
            self.tombstone(id);
            DeleteEffect::Tombstoned
        } else {
            self.remove_node(id);
            DeleteEffect::Removed
        }
    }

    /// Shows already-fetched children. Returns false if none were fetched.
    pub fn expand(&mut self, id: &ReplyId) -> bool {
        if !self.fetched.contains(id) || !self.contains(id) {
            return false;
        }
        self.expanded.insert(id.clone());
        true
    }

    /// Hides children without discarding them.
    pub fn collapse(&mut self, id: &ReplyId) -> bool {
        self.expanded.remove(id)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn prune_detached(&mut self) {
        let detached: Vec<ReplyId> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.slot == Slot::Detached)
            .map(|(id, _)| id.clone())
            .collect();
        if !detached.is_empty() {
            tracing::debug!(count = detached.len(), "Dropping replies missing from the new page");
        }
        for id in detached {
            self.remove_subtree(&id);
        }
    }

    /// Removes a node and all of its cached descendants from the arena.
    /// Does not touch the list that referenced the root.
    fn remove_subtree(&mut self, root: &ReplyId) -> Option<ReplyNode> {
        let removed = self.nodes.remove(root).map(|entry| entry.node);
        let mut pending = vec![root.clone()];
        while let Some(id) = pending.pop() {
            if id != *root {
                self.nodes.remove(&id);
            }
            self.fetched.remove(&id);
            self.expanded.remove(&id);
            self.stale.remove(&id);
            self.unconfirmed.remove(&id);
            if let Some(kids) = self.children.remove(&id) {
                pending.extend(kids);
            }
        }
        removed
    }
}
