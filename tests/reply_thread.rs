//! Engine behaviour against a scripted in-memory API.
//!
//! The sort tests run with paused time, so per-sort delays decide which
//! response lands first.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use rebuttal::api::{ApiError, ReplyApi};
use rebuttal::thread::{
    Author, Depth, Dispatch, EventOutcome, Page, ReplyError, ReplyId, ReplyNode, ReplyThread,
    SortKey, ThreadEvent, ThreadSettings, ValidationError, VotePhase, VoteSnapshot,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Scripted API
// ============================================================================

#[derive(Default)]
struct ScriptedApi {
    calls: Mutex<Vec<String>>,
    top_level: Mutex<HashMap<SortKey, Vec<ReplyNode>>>,
    children: Mutex<HashMap<ReplyId, Vec<ReplyNode>>>,
    delays: Mutex<HashMap<SortKey, Duration>>,
    child_delays: Mutex<HashMap<SortKey, Duration>>,
    top_level_failures: Mutex<VecDeque<ApiError>>,
    vote_results: Mutex<VecDeque<Result<VoteSnapshot, ApiError>>>,
    delete_failures: Mutex<VecDeque<ApiError>>,
    /// Number of calls that answer `AuthExpired` before the token works.
    expired_calls: AtomicUsize,
    refreshes: AtomicUsize,
}

impl ScriptedApi {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn check_auth(&self) -> Result<(), ApiError> {
        let expired = self
            .expired_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match expired {
            Ok(_) => Err(ApiError::AuthExpired),
            Err(_) => Ok(()),
        }
    }

    fn with_top_level(self, sort: SortKey, nodes: Vec<ReplyNode>) -> Self {
        self.top_level.lock().unwrap().insert(sort, nodes);
        self
    }

    fn with_children(self, parent: &str, nodes: Vec<ReplyNode>) -> Self {
        self.children
            .lock()
            .unwrap()
            .insert(ReplyId::from(parent), nodes);
        self
    }

    fn with_delay(self, sort: SortKey, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(sort, delay);
        self
    }

    fn with_child_delay(self, sort: SortKey, delay: Duration) -> Self {
        self.child_delays.lock().unwrap().insert(sort, delay);
        self
    }
}

impl ReplyApi for ScriptedApi {
    async fn list_top_level(
        &self,
        _opinion_id: &str,
        page: u32,
        _page_size: u32,
        sort: SortKey,
    ) -> Result<Page, ApiError> {
        self.record(format!("list:{sort}:{page}"));
        let delay = self.delays.lock().unwrap().get(&sort).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_auth()?;
        let failure = self.top_level_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let items = self
            .top_level
            .lock()
            .unwrap()
            .get(&sort)
            .cloned()
            .unwrap_or_default();
        Ok(Page {
            items,
            has_next_page: false,
        })
    }

    async fn list_children(
        &self,
        reply_id: &ReplyId,
        page: u32,
        _page_size: u32,
        sort: SortKey,
    ) -> Result<Page, ApiError> {
        self.record(format!("children:{reply_id}:{page}"));
        let delay = self.child_delays.lock().unwrap().get(&sort).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_auth()?;
        let items = self
            .children
            .lock()
            .unwrap()
            .get(reply_id)
            .cloned()
            .unwrap_or_default();
        Ok(Page {
            items,
            has_next_page: false,
        })
    }

    async fn create_reply(
        &self,
        _opinion_id: &str,
        content: &str,
        parent: Option<&ReplyId>,
    ) -> Result<ReplyNode, ApiError> {
        self.record(format!("create:{}", parent.map(ReplyId::as_str).unwrap_or("-")));
        self.check_auth()?;
        let mut created = reply("created", parent.map(ReplyId::as_str), parent.map_or(0, |_| 1));
        created.content = content.to_string();
        Ok(created)
    }

    async fn delete_reply(&self, reply_id: &ReplyId) -> Result<(), ApiError> {
        self.record(format!("delete:{reply_id}"));
        self.check_auth()?;
        let failure = self.delete_failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn toggle_upvote(&self, reply_id: &ReplyId) -> Result<VoteSnapshot, ApiError> {
        self.record(format!("upvote:{reply_id}"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.check_auth()?;
        self.vote_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::Timeout))
    }

    async fn refresh_credentials(&self) -> Result<(), ApiError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn reply(id: &str, parent: Option<&str>, depth: u8) -> ReplyNode {
    ReplyNode {
        id: ReplyId::from(id),
        parent_id: parent.map(ReplyId::from),
        depth: Depth::new(depth).unwrap(),
        content: format!("content of {id}"),
        is_deleted: false,
        author: Author {
            id: "u1".to_string(),
            display_name: "Ada".to_string(),
            avatar_url: None,
        },
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        is_edited: false,
        upvoted: false,
        upvote_count: 0,
        child_count: 0,
        is_owner: true,
    }
}

fn with_children(mut node: ReplyNode, count: u32) -> ReplyNode {
    node.child_count = count;
    node
}

fn id(s: &str) -> ReplyId {
    ReplyId::from(s)
}

fn ids(nodes: &[&ReplyNode]) -> Vec<String> {
    nodes.iter().map(|n| n.id.to_string()).collect()
}

type Thread = ReplyThread<ScriptedApi>;

async fn open(api: ScriptedApi) -> (Thread, mpsc::Receiver<ThreadEvent>, Arc<ScriptedApi>) {
    let api = Arc::new(api);
    let (mut thread, mut rx) = ReplyThread::new(Arc::clone(&api), "op-1", ThreadSettings::default());
    thread.open().unwrap();
    let outcomes = thread.settle(&mut rx).await;
    assert_eq!(outcomes, vec![EventOutcome::Applied]);
    (thread, rx, api)
}

/// p (depth 0) -> c (depth 1) -> g (depth 2), with both levels expanded.
async fn three_level_thread() -> (Thread, mpsc::Receiver<ThreadEvent>, Arc<ScriptedApi>) {
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![with_children(reply("p", None, 0), 1)])
        .with_children("p", vec![with_children(reply("c", Some("p"), 1), 1)])
        .with_children("c", vec![reply("g", Some("c"), 2)]);
    let (mut thread, mut rx, api) = open(api).await;
    thread.toggle_expand(&id("p")).unwrap();
    thread.settle(&mut rx).await;
    thread.toggle_expand(&id("c")).unwrap();
    thread.settle(&mut rx).await;
    (thread, rx, api)
}

fn voted(upvoted: bool, count: u32) -> ScriptedApi {
    let mut node = reply("r", None, 0);
    node.upvoted = upvoted;
    node.upvote_count = count;
    ScriptedApi::default().with_top_level(SortKey::Best, vec![node])
}

fn vote_of(thread: &Thread, reply_id: &str) -> (bool, u32) {
    let node = thread.get(&id(reply_id)).unwrap();
    (node.upvoted, node.upvote_count)
}

// ============================================================================
// Depth cap
// ============================================================================

#[tokio::test]
async fn test_reply_to_depth_two_is_rejected_without_a_request() {
    let (mut thread, _rx, api) = three_level_thread().await;
    assert_eq!(thread.get(&id("g")).unwrap().depth, Depth::MAX);

    let result = thread.submit_reply("one level too deep", Some(&id("g")));
    assert_eq!(
        result,
        Err(ReplyError::ValidationFailure(ValidationError::DepthCapReached(id("g"))))
    );
    assert_eq!(api.count("create"), 0);
}

#[tokio::test]
async fn test_reply_to_depth_one_is_placed_under_parent() {
    let (mut thread, mut rx, api) = three_level_thread().await;
    assert_eq!(thread.submit_reply("  nested  ", Some(&id("p"))).unwrap(), Dispatch::Sent);
    thread.settle(&mut rx).await;

    assert_eq!(api.count("create:p"), 1);
    assert_eq!(ids(&thread.children_of(&id("p"))), vec!["c", "created"]);
    assert_eq!(thread.get(&id("created")).unwrap().content, "nested");
    assert_eq!(thread.get(&id("p")).unwrap().child_count, 2);
}

// ============================================================================
// Votes
// ============================================================================

#[tokio::test]
async fn test_second_toggle_while_pending_sends_nothing() {
    let (mut thread, mut rx, api) = open(voted(false, 5)).await;
    api.vote_results.lock().unwrap().push_back(Ok(VoteSnapshot {
        upvoted: true,
        upvote_count: 6,
    }));

    assert_eq!(thread.toggle_upvote(&id("r")).unwrap(), Dispatch::Sent);
    assert_eq!(thread.toggle_upvote(&id("r")).unwrap(), Dispatch::AlreadyInFlight);
    assert_eq!(thread.vote_phase(&id("r")), VotePhase::Pending);
    thread.settle(&mut rx).await;

    assert_eq!(api.count("upvote"), 1);
    assert_eq!(thread.vote_phase(&id("r")), VotePhase::Idle);
}

#[tokio::test]
async fn test_optimistic_vote_matches_confirmation() {
    let (mut thread, mut rx, api) = open(voted(false, 5)).await;
    api.vote_results.lock().unwrap().push_back(Ok(VoteSnapshot {
        upvoted: true,
        upvote_count: 6,
    }));

    thread.toggle_upvote(&id("r")).unwrap();
    assert_eq!(vote_of(&thread, "r"), (true, 6));
    assert!(thread.is_vote_pending(&id("r")));

    let outcomes = thread.settle(&mut rx).await;
    assert_eq!(outcomes, vec![EventOutcome::Applied]);
    assert_eq!(vote_of(&thread, "r"), (true, 6));
}

#[tokio::test]
async fn test_server_count_wins_over_prediction() {
    let (mut thread, mut rx, api) = open(voted(false, 5)).await;
    api.vote_results.lock().unwrap().push_back(Ok(VoteSnapshot {
        upvoted: true,
        upvote_count: 7,
    }));

    thread.toggle_upvote(&id("r")).unwrap();
    assert_eq!(vote_of(&thread, "r"), (true, 6));
    thread.settle(&mut rx).await;
    assert_eq!(vote_of(&thread, "r"), (true, 7));
}

#[tokio::test]
async fn test_failed_vote_restores_previous_state() {
    let (mut thread, mut rx, api) = open(voted(false, 5)).await;
    api.vote_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::Timeout));

    thread.toggle_upvote(&id("r")).unwrap();
    assert_eq!(vote_of(&thread, "r"), (true, 6));

    let outcomes = thread.settle(&mut rx).await;
    assert!(matches!(
        outcomes.as_slice(),
        [EventOutcome::Failed(ReplyError::NetworkFailure(_))]
    ));
    assert_eq!(vote_of(&thread, "r"), (false, 5));
    assert!(!thread.is_vote_pending(&id("r")));

    // A new toggle is allowed once the failure settled.
    assert_eq!(thread.toggle_upvote(&id("r")).unwrap(), Dispatch::Sent);
}

#[tokio::test]
async fn test_unvote_never_goes_negative() {
    let (mut thread, mut rx, api) = open(voted(true, 0)).await;
    api.vote_results.lock().unwrap().push_back(Ok(VoteSnapshot {
        upvoted: false,
        upvote_count: 0,
    }));
    thread.toggle_upvote(&id("r")).unwrap();
    assert_eq!(vote_of(&thread, "r"), (false, 0));
    thread.settle(&mut rx).await;
}

// ============================================================================
// Expansion
// ============================================================================

#[tokio::test]
async fn test_double_expand_fetches_once_without_duplicates() {
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![with_children(reply("p", None, 0), 2)])
        .with_children("p", vec![reply("c1", Some("p"), 1), reply("c2", Some("p"), 1)]);
    let (mut thread, mut rx, api) = open(api).await;

    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::Sent);
    assert!(thread.is_loading_children(&id("p")));
    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::AlreadyInFlight);
    thread.settle(&mut rx).await;

    assert_eq!(api.count("children:p"), 1);
    assert_eq!(ids(&thread.children_of(&id("p"))), vec!["c1", "c2"]);
    assert!(thread.is_expanded(&id("p")));
}

#[tokio::test]
async fn test_collapse_keeps_children_and_reexpand_is_free() {
    let (mut thread, _rx, api) = three_level_thread().await;
    let before = api.count("children");

    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::Local);
    assert!(!thread.is_expanded(&id("p")));
    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::Local);
    assert_eq!(ids(&thread.children_of(&id("p"))), vec!["c"]);
    assert_eq!(api.count("children"), before);
}

#[tokio::test]
async fn test_created_reply_survives_first_child_page() {
    let others: Vec<ReplyNode> = (0..50)
        .map(|i| reply(&format!("c{i}"), Some("p"), 1))
        .collect();
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![with_children(reply("p", None, 0), 60)])
        .with_children("p", others);
    let (mut thread, mut rx, api) = open(api).await;

    thread.submit_reply("my reply", Some(&id("p"))).unwrap();
    let outcomes = thread.settle(&mut rx).await;
    assert_eq!(outcomes, vec![EventOutcome::Applied, EventOutcome::Applied]);
    assert_eq!(api.count("children:p:1"), 1);

    let children = thread.children_of(&id("p"));
    assert_eq!(children.len(), 51);
    assert_eq!(children.last().unwrap().id.as_str(), "created");
    assert_eq!(thread.get(&id("created")).unwrap().content, "my reply");
    assert_eq!(thread.get(&id("p")).unwrap().child_count, 61);
    assert!(thread.is_expanded(&id("p")));
}

// ============================================================================
// Sort
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sort_change_empties_list_and_discards_late_page() {
    let best: Vec<ReplyNode> = (0..20).map(|i| reply(&format!("b{i}"), None, 0)).collect();
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, best)
        .with_top_level(SortKey::Top, vec![reply("t0", None, 0), reply("t1", None, 0)])
        .with_delay(SortKey::Best, Duration::from_millis(100))
        .with_delay(SortKey::Top, Duration::from_millis(10));
    let (mut thread, mut rx, api) = open(api).await;
    assert_eq!(thread.top_level().len(), 20);

    // A best-order reload is still in flight when the sort changes.
    assert_eq!(thread.refresh().unwrap(), Dispatch::Sent);
    assert_eq!(thread.change_sort(SortKey::Top).unwrap(), Dispatch::Sent);
    assert!(thread.top_level().is_empty());
    assert_eq!(thread.sort(), SortKey::Top);
    assert!(thread.is_loading_top_level());

    let outcomes = thread.settle(&mut rx).await;
    assert_eq!(outcomes, vec![EventOutcome::Applied, EventOutcome::Discarded]);
    assert_eq!(ids(&thread.top_level()), vec!["t0", "t1"]);
    assert_eq!(api.count("list:best:1"), 2);
    assert_eq!(api.count("list:top:1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_switching_back_reuses_outstanding_request() {
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![reply("b0", None, 0)])
        .with_top_level(SortKey::Date, vec![reply("d0", None, 0)])
        .with_delay(SortKey::Best, Duration::from_millis(50));
    let (mut thread, mut rx, api) = open(api).await;

    thread.refresh().unwrap();
    thread.change_sort(SortKey::Date).unwrap();
    assert_eq!(thread.change_sort(SortKey::Best).unwrap(), Dispatch::AlreadyInFlight);

    thread.settle(&mut rx).await;
    assert_eq!(ids(&thread.top_level()), vec!["b0"]);
    assert_eq!(api.count("list:best"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expand_after_sort_change_is_not_blocked_by_old_child_fetch() {
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![with_children(reply("p", None, 0), 2)])
        .with_top_level(SortKey::Top, vec![with_children(reply("p", None, 0), 2)])
        .with_children("p", vec![reply("c1", Some("p"), 1), reply("c2", Some("p"), 1)])
        .with_child_delay(SortKey::Best, Duration::from_millis(100))
        .with_delay(SortKey::Top, Duration::from_millis(10));
    let (mut thread, mut rx, api) = open(api).await;

    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::Sent);
    assert_eq!(thread.change_sort(SortKey::Top).unwrap(), Dispatch::Sent);
    assert!(!thread.is_loading_children(&id("p")));

    // The new top-level page lands while the best-order child fetch is out.
    let event = rx.recv().await.unwrap();
    assert!(matches!(event, ThreadEvent::TopLevelLoaded { sort: SortKey::Top, .. }));
    assert_eq!(thread.handle_event(event), EventOutcome::Applied);

    assert_eq!(thread.toggle_expand(&id("p")).unwrap(), Dispatch::Sent);
    assert!(thread.is_loading_children(&id("p")));

    let outcomes = thread.settle(&mut rx).await;
    assert_eq!(outcomes, vec![EventOutcome::Applied, EventOutcome::Discarded]);
    assert_eq!(ids(&thread.children_of(&id("p"))), vec!["c1", "c2"]);
    assert!(thread.is_expanded(&id("p")));
    assert!(!thread.is_loading_children(&id("p")));
    assert_eq!(api.count("children:p:1"), 2);
}

#[tokio::test]
async fn test_failed_page_leaves_list_untouched() {
    let api = ScriptedApi::default().with_top_level(SortKey::Best, vec![reply("a", None, 0)]);
    let (mut thread, mut rx, api) = open(api).await;
    api.top_level_failures
        .lock()
        .unwrap()
        .push_back(ApiError::HttpStatus(503));

    thread.refresh().unwrap();
    let outcomes = thread.settle(&mut rx).await;
    assert!(matches!(outcomes.as_slice(), [EventOutcome::Failed(e)] if e.is_retryable()));
    assert_eq!(ids(&thread.top_level()), vec!["a"]);

    // Retrying the same intent works.
    thread.refresh().unwrap();
    assert_eq!(thread.settle(&mut rx).await, vec![EventOutcome::Applied]);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_deleting_child_updates_parent_count() {
    let api = ScriptedApi::default()
        .with_top_level(SortKey::Best, vec![with_children(reply("p", None, 0), 2)])
        .with_children("p", vec![reply("c1", Some("p"), 1), reply("c2", Some("p"), 1)]);
    let (mut thread, mut rx, api) = open(api).await;
    thread.toggle_expand(&id("p")).unwrap();
    thread.settle(&mut rx).await;

    assert_eq!(thread.delete_reply(&id("c1")).unwrap(), Dispatch::Sent);
    assert_eq!(thread.settle(&mut rx).await, vec![EventOutcome::Applied]);

    assert_eq!(api.count("delete:c1"), 1);
    assert_eq!(ids(&thread.children_of(&id("p"))), vec!["c2"]);
    assert_eq!(thread.get(&id("p")).unwrap().child_count, 1);
    assert!(thread.get(&id("c1")).is_none());
}

#[tokio::test]
async fn test_already_deleted_reply_counts_as_deleted() {
    let api = ScriptedApi::default().with_top_level(SortKey::Best, vec![reply("a", None, 0)]);
    let (mut thread, mut rx, api) = open(api).await;
    api.delete_failures
        .lock()
        .unwrap()
        .push_back(ApiError::NotFound);

    thread.delete_reply(&id("a")).unwrap();
    assert_eq!(thread.settle(&mut rx).await, vec![EventOutcome::Applied]);
    assert!(thread.top_level().is_empty());
}

#[tokio::test]
async fn test_failed_delete_keeps_reply() {
    let api = ScriptedApi::default().with_top_level(SortKey::Best, vec![reply("a", None, 0)]);
    let (mut thread, mut rx, api) = open(api).await;
    api.delete_failures
        .lock()
        .unwrap()
        .push_back(ApiError::Timeout);

    thread.delete_reply(&id("a")).unwrap();
    let outcomes = thread.settle(&mut rx).await;
    assert!(matches!(outcomes.as_slice(), [EventOutcome::Failed(_)]));
    assert_eq!(ids(&thread.top_level()), vec!["a"]);
    assert!(!thread.is_deleting(&id("a")));
}

#[tokio::test]
async fn test_deleting_parent_with_replies_keeps_thread_shape() {
    let (mut thread, mut rx, _api) = three_level_thread().await;
    thread.delete_reply(&id("c")).unwrap();
    thread.settle(&mut rx).await;

    let c = thread.get(&id("c")).unwrap();
    assert!(c.is_deleted);
    assert_eq!(c.display_content(), rebuttal::thread::DELETED_PLACEHOLDER);
    assert_eq!(ids(&thread.children_of(&id("c"))), vec!["g"]);
    assert_eq!(thread.get(&id("p")).unwrap().child_count, 1);
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test]
async fn test_expired_credentials_refresh_once_and_retry() {
    let api = ScriptedApi::default().with_top_level(SortKey::Best, vec![reply("a", None, 0)]);
    api.expired_calls.store(1, Ordering::SeqCst);
    let (thread, _rx, api) = open(api).await;

    assert_eq!(ids(&thread.top_level()), vec!["a"]);
    assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(api.count("list"), 2);
}

#[tokio::test]
async fn test_still_expired_after_refresh_surfaces_network_failure() {
    let api = Arc::new(ScriptedApi::default());
    api.expired_calls.store(10, Ordering::SeqCst);
    let (mut thread, mut rx) = ReplyThread::new(Arc::clone(&api), "op-1", ThreadSettings::default());

    thread.open().unwrap();
    let outcomes = thread.settle(&mut rx).await;
    assert!(matches!(
        outcomes.as_slice(),
        [EventOutcome::Failed(ReplyError::NetworkFailure(_))]
    ));
    assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(api.count("list"), 2);
}
