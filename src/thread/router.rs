//! Folds the outcome of create, delete and vote requests into the tree.

use super::cache::{DeleteEffect, TreeCache};
use super::error::{ReplyError, ValidationError};
use super::model::{ReplyId, ReplyNode, VoteSnapshot};
use super::votes::{VotePhase, VoteReconciler};

/// Checks that `target` can receive a reply before anything is submitted.
pub fn validate_reply_target(cache: &TreeCache, target: &ReplyId) -> Result<(), ValidationError> {
    let node = cache
        .get(target)
        .ok_or_else(|| ValidationError::UnknownReply(target.clone()))?;
    if node.is_deleted {
        return Err(ValidationError::Deleted(target.clone()));
    }
    if !node.depth.accepts_replies() {
        return Err(ValidationError::DepthCapReached(target.clone()));
    }
    Ok(())
}

/// Places a reply the server created against `parent`.
pub fn route_create(cache: &mut TreeCache, node: ReplyNode, parent: Option<&ReplyId>) -> bool {
    let id = node.id.clone();
    let placed = cache.insert_created(node, parent);
    if placed {
        tracing::debug!(reply_id = %id, parent_id = ?parent.map(ReplyId::as_str), "Created reply placed");
    } else {
        tracing::debug!(reply_id = %id, "Created reply not placed");
    }
    placed
}

/// Applies a confirmed (or already-gone) deletion wherever the reply lives.
pub fn route_delete(cache: &mut TreeCache, id: &ReplyId) -> DeleteEffect {
    let parent = cache.parent_of(id).cloned();
    let effect = cache.delete(id);
    tracing::debug!(reply_id = %id, parent_id = ?parent.as_ref().map(ReplyId::as_str), ?effect, "Deletion applied");
    effect
}

/// Hands a vote result to the reconciler; it decides what is shown.
pub fn route_vote(
    votes: &mut VoteReconciler,
    cache: &mut TreeCache,
    id: &ReplyId,
    result: &Result<VoteSnapshot, ReplyError>,
) -> VotePhase {
    match result {
        Ok(server) => votes.confirm(cache, id, *server),
        Err(_) => votes.roll_back(cache, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::cache::tests::node;

    fn id(s: &str) -> ReplyId {
        ReplyId::from(s)
    }

    fn three_levels() -> TreeCache {
        let mut cache = TreeCache::new();
        let mut p = node("p", None, 0);
        p.child_count = 1;
        let mut c = node("c", Some("p"), 1);
        c.child_count = 1;
        cache.replace_top_level(vec![p], false);
        cache.set_children(&id("p"), vec![c], false);
        cache.set_children(&id("c"), vec![node("g", Some("c"), 2)], false);
        cache
    }

    #[test]
    fn test_reply_to_depth_two_rejected() {
        let cache = three_levels();
        assert_eq!(
            validate_reply_target(&cache, &id("g")),
            Err(ValidationError::DepthCapReached(id("g")))
        );
        assert!(validate_reply_target(&cache, &id("c")).is_ok());
        assert!(validate_reply_target(&cache, &id("p")).is_ok());
    }

    #[test]
    fn test_reply_to_unknown_or_deleted_rejected() {
        let mut cache = three_levels();
        assert_eq!(
            validate_reply_target(&cache, &id("zzz")),
            Err(ValidationError::UnknownReply(id("zzz")))
        );
        cache.tombstone(&id("c"));
        assert_eq!(
            validate_reply_target(&cache, &id("c")),
            Err(ValidationError::Deleted(id("c")))
        );
    }

    #[test]
    fn test_delete_depth_one_leaf_decrements_parent() {
        let mut cache = TreeCache::new();
        let mut p = node("p", None, 0);
        p.child_count = 2;
        cache.replace_top_level(vec![p], false);
        cache.set_children(
            &id("p"),
            vec![node("c1", Some("p"), 1), node("c2", Some("p"), 1)],
            false,
        );

        assert_eq!(route_delete(&mut cache, &id("c1")), DeleteEffect::Removed);
        let remaining: Vec<_> = cache.children_of(&id("p")).iter().map(|n| n.id.clone()).collect();
        assert_eq!(remaining, vec![id("c2")]);
        assert_eq!(cache.get(&id("p")).unwrap().child_count, 1);
    }

    #[test]
    fn test_route_create_under_parent() {
        let mut cache = three_levels();
        assert!(route_create(&mut cache, node("c2", Some("p"), 1), Some(&id("p"))));
        assert_eq!(cache.get(&id("p")).unwrap().child_count, 2);
    }

    #[test]
    fn test_route_vote_failure_rolls_back() {
        let mut cache = three_levels();
        let mut votes = VoteReconciler::new();
        votes.begin(&mut cache, &id("c"));
        let phase = route_vote(
            &mut votes,
            &mut cache,
            &id("c"),
            &Err(ReplyError::NetworkFailure("offline".to_string())),
        );
        assert_eq!(phase, VotePhase::RolledBack);
        assert!(!cache.get(&id("c")).unwrap().upvoted);
    }
}
