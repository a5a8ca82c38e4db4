//! The reply engine behind one open thread view.
//!
//! [`ReplyThread`] owns the tree cache and its controllers. Intents are
//! synchronous: they validate, claim a guard, and spawn the remote call.
//! Each spawned call reports back as a [`ThreadEvent`] on the channel handed
//! out by [`ReplyThread::new`], and the owner folds it in with
//! [`ReplyThread::handle_event`]. Only the owner mutates state, so no locks
//! are involved.
//!
//! # Freshness
//!
//! Results that stopped being relevant while in flight are discarded rather
//! than applied: top-level pages requested under a previous sort order or
//! before a reload, child pages for parents that left the tree, and creates
//! whose parent has disappeared.

use super::cache::{DeleteEffect, TreeCache};
use super::error::{ReplyError, ValidationError};
use super::model::{Page, ReplyId, ReplyNode, SortKey, VoteSnapshot};
use super::pagination::{FetchScope, PaginationController, CHILD_PAGE_SIZE, TOP_LEVEL_PAGE_SIZE};
use super::router::{route_create, route_delete, route_vote, validate_reply_target};
use super::sort::SortController;
use super::votes::{VotePhase, VoteReconciler};
use crate::api::{with_auth_retry, ReplyApi};
use crate::config::Config;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Default upper bound on reply length, in characters.
pub const MAX_REPLY_LENGTH: usize = 1000;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSettings {
    pub top_level_page_size: u32,
    pub child_page_size: u32,
    pub max_reply_length: usize,
    pub initial_sort: SortKey,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            top_level_page_size: TOP_LEVEL_PAGE_SIZE,
            child_page_size: CHILD_PAGE_SIZE,
            max_reply_length: MAX_REPLY_LENGTH,
            initial_sort: SortKey::default(),
        }
    }
}

impl From<&Config> for ThreadSettings {
    fn from(config: &Config) -> Self {
        Self {
            top_level_page_size: config.top_level_page_size,
            child_page_size: config.child_page_size,
            max_reply_length: config.max_reply_length,
            initial_sort: config.default_sort,
        }
    }
}

/// What an intent did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A request was issued; its result will arrive as a [`ThreadEvent`].
    Sent,
    /// An identical request is outstanding; its result will cover this one.
    AlreadyInFlight,
    /// Handled from the cache without a request.
    Local,
    /// Nothing to do (no more pages, sort unchanged, no replies to show).
    Nothing,
}

/// How a [`ThreadEvent`] was folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// The result arrived after it stopped being relevant.
    Discarded,
    /// The request failed. The cache is as it was before the intent (votes
    /// are rolled back).
    Failed(ReplyError),
}

/// Result of one remote call, sent back from its task.
#[derive(Debug)]
pub enum ThreadEvent {
    TopLevelLoaded {
        sort: SortKey,
        page: u32,
        result: Result<Page, ReplyError>,
    },
    ChildrenLoaded {
        parent: ReplyId,
        page: u32,
        sort: SortKey,
        result: Result<Page, ReplyError>,
    },
    ReplyCreated {
        parent: Option<ReplyId>,
        result: Result<ReplyNode, ReplyError>,
    },
    ReplyDeleted {
        id: ReplyId,
        result: Result<(), ReplyError>,
    },
    VoteSettled {
        id: ReplyId,
        result: Result<VoteSnapshot, ReplyError>,
    },
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReplyThread<A: ReplyApi + 'static> {
    api: Arc<A>,
    opinion_id: Arc<str>,
    settings: ThreadSettings,
    cache: TreeCache,
    pages: PaginationController,
    votes: VoteReconciler,
    sort: SortController,
    /// Targets with a submission outstanding (`None` is the top level).
    submitting: HashSet<Option<ReplyId>>,
    deleting: HashSet<ReplyId>,
    outstanding: usize,
    events_tx: mpsc::Sender<ThreadEvent>,
}

impl<A: ReplyApi + 'static> ReplyThread<A> {
    /// Creates the engine for one opinion's thread. Nothing is fetched until
    /// [`open`](Self::open).
    pub fn new(
        api: Arc<A>,
        opinion_id: impl Into<Arc<str>>,
        settings: ThreadSettings,
    ) -> (Self, mpsc::Receiver<ThreadEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let thread = Self {
            api,
            opinion_id: opinion_id.into(),
            pages: PaginationController::new(settings.top_level_page_size, settings.child_page_size),
            sort: SortController::new(settings.initial_sort),
            settings,
            cache: TreeCache::new(),
            votes: VoteReconciler::new(),
            submitting: HashSet::new(),
            deleting: HashSet::new(),
            outstanding: 0,
            events_tx,
        };
        (thread, events_rx)
    }

    // ========================================================================
    // Read-only state
    // ========================================================================

    pub fn opinion_id(&self) -> &str {
        &self.opinion_id
    }

    pub fn settings(&self) -> &ThreadSettings {
        &self.settings
    }

    pub fn sort(&self) -> SortKey {
        self.sort.active()
    }

    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    pub fn top_level(&self) -> Vec<&ReplyNode> {
        self.cache.top_level()
    }

    pub fn children_of(&self, id: &ReplyId) -> Vec<&ReplyNode> {
        self.cache.children_of(id)
    }

    pub fn is_expanded(&self, id: &ReplyId) -> bool {
        self.cache.is_expanded(id)
    }

    pub fn get(&self, id: &ReplyId) -> Option<&ReplyNode> {
        self.cache.get(id)
    }

    pub fn vote_phase(&self, id: &ReplyId) -> VotePhase {
        self.votes.phase(id)
    }

    pub fn is_vote_pending(&self, id: &ReplyId) -> bool {
        self.votes.is_pending(id)
    }

    pub fn is_deleting(&self, id: &ReplyId) -> bool {
        self.deleting.contains(id)
    }

    pub fn is_submitting(&self, parent: Option<&ReplyId>) -> bool {
        self.submitting.contains(&parent.cloned())
    }

    pub fn is_loading_top_level(&self) -> bool {
        self.pages.is_loading_top_level(self.sort.active())
    }

    pub fn is_loading_children(&self, id: &ReplyId) -> bool {
        self.pages.is_loading_children(id, self.sort.active())
    }

    pub fn has_more_top_level(&self) -> bool {
        self.pages.has_more_top_level()
    }

    pub fn has_more_children(&self, id: &ReplyId) -> bool {
        self.pages.has_more_children(id)
    }

    /// True when the children shown under `id` were loaded under an older
    /// sort order.
    pub fn is_stale(&self, id: &ReplyId) -> bool {
        self.cache.is_stale(id)
    }

    /// Number of spawned requests whose event has not been handled yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    // ========================================================================
    // Intents
    // ========================================================================

    /// Loads the first top-level page.
    pub fn open(&mut self) -> Result<Dispatch, ReplyError> {
        self.refresh()
    }

    /// Reloads from page 1 under the current sort. The visible list stays
    /// until the new page replaces it.
    pub fn refresh(&mut self) -> Result<Dispatch, ReplyError> {
        self.pages.reset_top_level();
        Ok(self.request_top_level())
    }

    pub fn load_more_top_level(&mut self) -> Result<Dispatch, ReplyError> {
        Ok(self.request_top_level())
    }

    /// Switches the sort order: the top-level list empties at once and page 1
    /// is requested under `key`. Outstanding requests are left to finish and
    /// are discarded on arrival.
    pub fn change_sort(&mut self, key: SortKey) -> Result<Dispatch, ReplyError> {
        if !self.sort.change(key) {
            return Ok(Dispatch::Nothing);
        }
        tracing::info!(sort = %key, "Sort changed, reloading top level");
        self.cache.clear_top_level();
        self.pages.reset_top_level();
        Ok(self.request_top_level())
    }

    /// Shows or hides the replies under `id`.
    ///
    /// Collapsing and re-expanding already fetched children is local. The
    /// first expansion, and re-expanding children cached under an older sort
    /// order, fetch page 1.
    pub fn toggle_expand(&mut self, id: &ReplyId) -> Result<Dispatch, ReplyError> {
        let child_count = self
            .cache
            .get(id)
            .map(|node| node.child_count)
            .ok_or_else(|| ValidationError::UnknownReply(id.clone()))?;

        if self.cache.is_expanded(id) {
            self.cache.collapse(id);
            return Ok(Dispatch::Local);
        }
        if self.cache.has_fetched_children(id) && !self.cache.is_stale(id) {
            self.cache.expand(id);
            return Ok(Dispatch::Local);
        }
        if !self.cache.has_fetched_children(id) && child_count == 0 {
            return Ok(Dispatch::Nothing);
        }
        Ok(self.request_children(id.clone(), 1))
    }

    /// Fetches the next page of children under `id`, if the server has more.
    pub fn load_more_children(&mut self, id: &ReplyId) -> Result<Dispatch, ReplyError> {
        if !self.cache.contains(id) {
            return Err(ValidationError::UnknownReply(id.clone()).into());
        }
        match self.pages.next_children(id, self.sort.active()) {
            Some(FetchScope::Children { page, .. }) => Ok(self.request_children(id.clone(), page)),
            _ => Ok(Dispatch::Nothing),
        }
    }

    /// Submits a reply to the opinion (`parent == None`) or to a reply.
    ///
    /// Content is trimmed. Empty or over-long content, an unknown or deleted
    /// parent, and a parent at the depth cap are refused without a request.
    pub fn submit_reply(
        &mut self,
        content: &str,
        parent: Option<&ReplyId>,
    ) -> Result<Dispatch, ReplyError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        if content.chars().count() > self.settings.max_reply_length {
            return Err(ValidationError::ContentTooLong {
                max: self.settings.max_reply_length,
            }
            .into());
        }
        if let Some(target) = parent {
            validate_reply_target(&self.cache, target)?;
        }

        let target = parent.cloned();
        if !self.submitting.insert(target.clone()) {
            tracing::debug!(parent_id = ?target, "Submission already in flight");
            return Ok(Dispatch::AlreadyInFlight);
        }

        let api = Arc::clone(&self.api);
        let opinion = Arc::clone(&self.opinion_id);
        let content = content.to_owned();
        let for_event = target.clone();
        let for_panic = target.clone();
        self.spawn_request(
            "create_reply",
            async move {
                let result = with_auth_retry(&*api, "create_reply", || {
                    api.create_reply(&opinion, &content, target.as_ref())
                })
                .await
                .map_err(ReplyError::from);
                ThreadEvent::ReplyCreated {
                    parent: for_event,
                    result,
                }
            },
            move |error| ThreadEvent::ReplyCreated {
                parent: for_panic,
                result: Err(error),
            },
        );
        Ok(Dispatch::Sent)
    }

    /// Toggles the current user's upvote, showing the predicted result at
    /// once. A second toggle while one is pending is refused.
    pub fn toggle_upvote(&mut self, id: &ReplyId) -> Result<Dispatch, ReplyError> {
        let node = self
            .cache
            .get(id)
            .ok_or_else(|| ValidationError::UnknownReply(id.clone()))?;
        if node.is_deleted {
            return Err(ValidationError::Deleted(id.clone()).into());
        }
        if self.votes.begin(&mut self.cache, id).is_none() {
            return Ok(Dispatch::AlreadyInFlight);
        }

        let api = Arc::clone(&self.api);
        let reply_id = id.clone();
        let for_panic = id.clone();
        self.spawn_request(
            "toggle_upvote",
            async move {
                let result = with_auth_retry(&*api, "toggle_upvote", || api.toggle_upvote(&reply_id))
                    .await
                    .map_err(ReplyError::from);
                ThreadEvent::VoteSettled {
                    id: reply_id,
                    result,
                }
            },
            move |error| ThreadEvent::VoteSettled {
                id: for_panic,
                result: Err(error),
            },
        );
        Ok(Dispatch::Sent)
    }

    /// Deletes a reply the current user owns.
    pub fn delete_reply(&mut self, id: &ReplyId) -> Result<Dispatch, ReplyError> {
        let node = self
            .cache
            .get(id)
            .ok_or_else(|| ValidationError::UnknownReply(id.clone()))?;
        if !node.is_owner {
            return Err(ValidationError::NotOwner(id.clone()).into());
        }
        if node.is_deleted {
            return Err(ValidationError::Deleted(id.clone()).into());
        }
        if !self.deleting.insert(id.clone()) {
            return Ok(Dispatch::AlreadyInFlight);
        }

        let api = Arc::clone(&self.api);
        let reply_id = id.clone();
        let for_panic = id.clone();
        self.spawn_request(
            "delete_reply",
            async move {
                let result = with_auth_retry(&*api, "delete_reply", || api.delete_reply(&reply_id))
                    .await
                    .map_err(ReplyError::from);
                ThreadEvent::ReplyDeleted {
                    id: reply_id,
                    result,
                }
            },
            move |error| ThreadEvent::ReplyDeleted {
                id: for_panic,
                result: Err(error),
            },
        );
        Ok(Dispatch::Sent)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn request_top_level(&mut self) -> Dispatch {
        let sort = self.sort.active();
        let Some(scope) = self.pages.next_top_level(sort) else {
            return Dispatch::Nothing;
        };
        let &FetchScope::TopLevel { page, .. } = &scope else {
            return Dispatch::Nothing;
        };
        if !self.pages.begin(&scope) {
            tracing::debug!(page, sort = %sort, "Top-level fetch already in flight");
            return Dispatch::AlreadyInFlight;
        }

        let api = Arc::clone(&self.api);
        let opinion = Arc::clone(&self.opinion_id);
        let page_size = self.pages.top_level_page_size();
        tracing::debug!(page, sort = %sort, "Requesting top-level page");
        self.spawn_request(
            "list_top_level",
            async move {
                let result = with_auth_retry(&*api, "list_top_level", || {
                    api.list_top_level(&opinion, page, page_size, sort)
                })
                .await
                .map_err(ReplyError::from);
                ThreadEvent::TopLevelLoaded { sort, page, result }
            },
            move |error| ThreadEvent::TopLevelLoaded {
                sort,
                page,
                result: Err(error),
            },
        );
        Dispatch::Sent
    }

    fn request_children(&mut self, parent: ReplyId, page: u32) -> Dispatch {
        let sort = self.sort.active();
        let scope = FetchScope::Children {
            parent: parent.clone(),
            page,
            sort,
        };
        if !self.pages.begin(&scope) {
            tracing::debug!(reply_id = %parent, page, sort = %sort, "Child fetch already in flight");
            return Dispatch::AlreadyInFlight;
        }

        let api = Arc::clone(&self.api);
        let page_size = self.pages.child_page_size();
        let for_panic = parent.clone();
        tracing::debug!(reply_id = %parent, page, "Requesting child page");
        self.spawn_request(
            "list_children",
            async move {
                let result = with_auth_retry(&*api, "list_children", || {
                    api.list_children(&parent, page, page_size, sort)
                })
                .await
                .map_err(ReplyError::from);
                ThreadEvent::ChildrenLoaded {
                    parent,
                    page,
                    sort,
                    result,
                }
            },
            move |error| ThreadEvent::ChildrenLoaded {
                parent: for_panic,
                page,
                sort,
                result: Err(error),
            },
        );
        Dispatch::Sent
    }

    /// Spawns `request` and forwards its event. A panicking task still
    /// reports a failure so the guard it holds is released.
    fn spawn_request<F, P>(&mut self, task: &'static str, request: F, on_panic: P)
    where
        F: Future<Output = ThreadEvent> + Send + 'static,
        P: FnOnce(ReplyError) -> ThreadEvent + Send + 'static,
    {
        self.outstanding += 1;
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match catch_task_panic(request).await {
                Ok(event) => event,
                Err(panic_msg) => {
                    tracing::error!(task, error = %panic_msg, "Request task panicked");
                    on_panic(ReplyError::NetworkFailure(format!("{task} panicked: {panic_msg}")))
                }
            };
            if let Err(e) = tx.send(event).await {
                tracing::warn!(error = %e, task, "Channel send failed (receiver dropped)");
            }
        });
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Folds one event into the tree.
    pub fn handle_event(&mut self, event: ThreadEvent) -> EventOutcome {
        self.outstanding = self.outstanding.saturating_sub(1);
        match event {
            ThreadEvent::TopLevelLoaded { sort, page, result } => {
                self.on_top_level_loaded(sort, page, result)
            }
            ThreadEvent::ChildrenLoaded {
                parent,
                page,
                sort,
                result,
            } => self.on_children_loaded(parent, page, sort, result),
            ThreadEvent::ReplyCreated { parent, result } => self.on_reply_created(parent, result),
            ThreadEvent::ReplyDeleted { id, result } => self.on_reply_deleted(id, result),
            ThreadEvent::VoteSettled { id, result } => {
                match route_vote(&mut self.votes, &mut self.cache, &id, &result) {
                    VotePhase::Confirmed => EventOutcome::Applied,
                    VotePhase::RolledBack => match result {
                        Err(e) => EventOutcome::Failed(e),
                        Ok(_) => EventOutcome::Applied,
                    },
                    VotePhase::Idle | VotePhase::Pending => EventOutcome::Discarded,
                }
            }
        }
    }

    /// Handles events until every spawned request has reported back.
    pub async fn settle(&mut self, events: &mut mpsc::Receiver<ThreadEvent>) -> Vec<EventOutcome> {
        let mut outcomes = Vec::new();
        while self.outstanding > 0 {
            match events.recv().await {
                Some(event) => outcomes.push(self.handle_event(event)),
                None => break,
            }
        }
        outcomes
    }

    fn on_top_level_loaded(
        &mut self,
        sort: SortKey,
        page: u32,
        result: Result<Page, ReplyError>,
    ) -> EventOutcome {
        self.pages.finish(&FetchScope::TopLevel { page, sort });

        if !self.sort.is_current(sort) {
            tracing::debug!(sort = %sort, current = %self.sort.active(), page, "Discarding page for previous sort");
            return EventOutcome::Discarded;
        }
        if !self.pages.accepts_top_level(page) {
            tracing::debug!(sort = %sort, page, "Discarding out-of-order top-level page");
            return EventOutcome::Discarded;
        }

        match result {
            Ok(loaded) => {
                tracing::debug!(sort = %sort, page, items = loaded.items.len(), "Top-level page applied");
                self.cache.replace_top_level(loaded.items, page > 1);
                self.pages.record_top_level(page, loaded.has_next_page);
                EventOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(error = %e, sort = %sort, page, "Top-level fetch failed");
                EventOutcome::Failed(e)
            }
        }
    }

    fn on_children_loaded(
        &mut self,
        parent: ReplyId,
        page: u32,
        sort: SortKey,
        result: Result<Page, ReplyError>,
    ) -> EventOutcome {
        self.pages.finish(&FetchScope::Children {
            parent: parent.clone(),
            page,
            sort,
        });

        if !self.cache.contains(&parent) {
            tracing::debug!(reply_id = %parent, page, "Discarding children of a reply no longer in the tree");
            self.pages.forget_children(&parent);
            return EventOutcome::Discarded;
        }
        if !self.sort.is_current(sort) {
            tracing::debug!(reply_id = %parent, sort = %sort, "Discarding children for previous sort");
            return EventOutcome::Discarded;
        }
        if !self.pages.accepts_children(&parent, page) {
            tracing::debug!(reply_id = %parent, page, "Discarding out-of-order child page");
            return EventOutcome::Discarded;
        }

        match result {
            Ok(loaded) => {
                tracing::debug!(reply_id = %parent, page, items = loaded.items.len(), "Child page applied");
                self.cache.set_children(&parent, loaded.items, page > 1);
                self.pages.record_children(&parent, page, loaded.has_next_page);
                EventOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(error = %e, reply_id = %parent, page, "Child fetch failed");
                EventOutcome::Failed(e)
            }
        }
    }

    fn on_reply_created(
        &mut self,
        parent: Option<ReplyId>,
        result: Result<ReplyNode, ReplyError>,
    ) -> EventOutcome {
        self.submitting.remove(&parent);

        let node = match result {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(error = %e, parent_id = ?parent, "Reply submission failed");
                return EventOutcome::Failed(e);
            }
        };

        if let Some(parent) = parent.as_ref() {
            if !self.cache.contains(parent) {
                tracing::debug!(reply_id = %node.id, parent_id = %parent, "Parent left the tree, dropping created reply");
                return EventOutcome::Discarded;
            }
        }

        route_create(&mut self.cache, node, parent.as_ref());

        // The parent now shows only the new reply; load the rest.
        if let Some(parent) = parent {
            if !self.cache.has_fetched_children(&parent) {
                self.request_children(parent, 1);
            }
        }
        EventOutcome::Applied
    }

    fn on_reply_deleted(&mut self, id: ReplyId, result: Result<(), ReplyError>) -> EventOutcome {
        self.deleting.remove(&id);

        match result {
            Ok(()) | Err(ReplyError::NotFound) => {}
            Err(e) => {
                tracing::warn!(error = %e, reply_id = %id, "Delete failed");
                return EventOutcome::Failed(e);
            }
        }

        match route_delete(&mut self.cache, &id) {
            DeleteEffect::Removed => {
                self.pages.forget_children(&id);
                EventOutcome::Applied
            }
            DeleteEffect::Tombstoned => EventOutcome::Applied,
            DeleteEffect::Missing => EventOutcome::Discarded,
        }
    }
}

// ============================================================================
// Task helpers
// ============================================================================

/// Runs `future`, turning a panic into `Err(message)`.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}
