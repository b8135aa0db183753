//! Browsing context tree
//!
//! One entry per window, tab or frame. Contexts are keyed by the CDP target
//! id (top-level) or frame id (children); entities are owned by the storage
//! and referenced everywhere else by id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::protocol::{ContextInfo, ReadinessState};
use crate::target::CdpTarget;

/// The user-context id used when CDP reports the default browser context
pub const DEFAULT_USER_CONTEXT: &str = "default";

/// A single browsing context
pub struct BrowsingContext {
    pub id: String,
    pub parent: Option<String>,
    pub user_context: String,
    pub url: String,
    pub ready_state: ReadinessState,
    /// Bumped when a new document starts loading; navigation waits compare
    /// against the epoch they started from
    pub navigation_epoch: u64,
    /// Loader id of the current navigation, used as the BiDi navigation id
    pub navigation_id: Option<String>,
    /// Child ids in creation order
    pub children: Vec<String>,
    pub target: Arc<CdpTarget>,
}

impl BrowsingContext {
    pub fn new(
        id: impl Into<String>,
        parent: Option<String>,
        user_context: impl Into<String>,
        url: impl Into<String>,
        target: Arc<CdpTarget>,
    ) -> Self {
        Self {
            id: id.into(),
            parent,
            user_context: user_context.into(),
            url: url.into(),
            ready_state: ReadinessState::None,
            navigation_epoch: 0,
            navigation_id: None,
            children: Vec::new(),
            target,
        }
    }
}

/// Index of the browsing-context tree
#[derive(Clone)]
pub struct BrowsingContextStorage {
    contexts: Arc<Mutex<HashMap<String, BrowsingContext>>>,
}

impl BrowsingContextStorage {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert a context and link it under its parent
    pub async fn insert(&self, context: BrowsingContext) {
        let mut contexts = self.contexts.lock().await;
        debug_assert!(
            !contexts.contains_key(&context.id),
            "duplicate context id {}",
            context.id
        );
        if let Some(parent_id) = &context.parent {
            if let Some(parent) = contexts.get_mut(parent_id) {
                parent.children.push(context.id.clone());
            }
        }
        contexts.insert(context.id.clone(), context);
    }

    /// Remove a context and its whole subtree. Returns the removed ids,
    /// deepest first, so destruction events can be emitted bottom-up after
    /// the storage no longer knows them.
    pub async fn remove_subtree(&self, id: &str) -> Vec<String> {
        let mut contexts = self.contexts.lock().await;

        let mut order = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(ctx) = contexts.get(&current) {
                stack.extend(ctx.children.iter().cloned());
            }
            order.push(current);
        }

        // Detach from the surviving parent first
        if let Some(parent_id) = contexts.get(id).and_then(|c| c.parent.clone()) {
            if let Some(parent) = contexts.get_mut(&parent_id) {
                parent.children.retain(|child| child != id);
            }
        }

        order.reverse();
        order.retain(|ctx_id| contexts.remove(ctx_id).is_some());
        order
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.contexts.lock().await.contains_key(id)
    }

    pub async fn parent_of(&self, id: &str) -> Option<String> {
        self.contexts.lock().await.get(id)?.parent.clone()
    }

    pub async fn user_context_of(&self, id: &str) -> Option<String> {
        Some(self.contexts.lock().await.get(id)?.user_context.clone())
    }

    pub async fn target_of(&self, id: &str) -> Option<Arc<CdpTarget>> {
        Some(Arc::clone(&self.contexts.lock().await.get(id)?.target))
    }

    /// Replace the owning target of `id` (OOPIF swap keeps the context)
    pub async fn rebind_target(&self, id: &str, target: Arc<CdpTarget>) -> bool {
        match self.contexts.lock().await.get_mut(id) {
            Some(ctx) => {
                ctx.target = target;
                true
            }
            None => false,
        }
    }

    pub async fn set_url(&self, id: &str, url: &str) {
        if let Some(ctx) = self.contexts.lock().await.get_mut(id) {
            ctx.url = url.to_string();
        }
    }

    /// Record the start of a navigation: new epoch, readiness back to none
    pub async fn begin_navigation(&self, id: &str, loader_id: &str) {
        if let Some(ctx) = self.contexts.lock().await.get_mut(id) {
            ctx.navigation_epoch += 1;
            ctx.navigation_id = Some(loader_id.to_string());
            ctx.ready_state = ReadinessState::None;
        }
    }

    pub async fn set_ready_state(&self, id: &str, state: ReadinessState) {
        if let Some(ctx) = self.contexts.lock().await.get_mut(id) {
            ctx.ready_state = state;
        }
    }

    /// (epoch, readiness, navigation id) for navigation waits
    pub async fn navigation_progress(&self, id: &str) -> Option<(u64, ReadinessState, Option<String>)> {
        let contexts = self.contexts.lock().await;
        let ctx = contexts.get(id)?;
        Some((ctx.navigation_epoch, ctx.ready_state, ctx.navigation_id.clone()))
    }

    /// Ids from `id` up to its root, starting with `id` itself.
    /// Parent pointers never cycle, so the walk terminates.
    pub async fn ancestors(&self, id: &str) -> Vec<String> {
        let contexts = self.contexts.lock().await;
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(ctx_id) = current {
            current = contexts.get(&ctx_id).and_then(|c| c.parent.clone());
            chain.push(ctx_id);
        }
        chain
    }

    /// Walk parents to the top-level ancestor
    pub async fn top_level_id(&self, id: &str) -> Option<String> {
        let contexts = self.contexts.lock().await;
        if !contexts.contains_key(id) {
            return None;
        }
        let mut current = id.to_string();
        while let Some(parent) = contexts.get(&current).and_then(|c| c.parent.clone()) {
            current = parent;
        }
        Some(current)
    }

    pub async fn is_top_level(&self, id: &str) -> bool {
        matches!(self.contexts.lock().await.get(id), Some(ctx) if ctx.parent.is_none())
    }

    pub async fn top_level_ids(&self) -> Vec<String> {
        let contexts = self.contexts.lock().await;
        let mut ids: Vec<String> = contexts
            .values()
            .filter(|c| c.parent.is_none())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The context whose owning target uses the given CDP session
    pub async fn find_by_session(&self, session_id: &str) -> Option<String> {
        let contexts = self.contexts.lock().await;
        contexts
            .values()
            .find(|c| c.target.session_id() == session_id)
            .map(|c| c.id.clone())
    }

    /// Every distinct target owning at least one context
    pub async fn all_targets(&self) -> Vec<Arc<CdpTarget>> {
        let contexts = self.contexts.lock().await;
        let mut seen = std::collections::HashSet::new();
        contexts
            .values()
            .filter(|c| seen.insert(c.target.session_id().to_string()))
            .map(|c| Arc::clone(&c.target))
            .collect()
    }

    /// Flat info for one context, children omitted
    pub async fn info_of(&self, id: &str) -> Option<ContextInfo> {
        let contexts = self.contexts.lock().await;
        let ctx = contexts.get(id)?;
        Some(ContextInfo {
            context: ctx.id.clone(),
            url: ctx.url.clone(),
            user_context: ctx.user_context.clone(),
            children: None,
            parent: ctx.parent.clone(),
        })
    }

    /// Subtree ids in the same bottom-up order `remove_subtree` would use,
    /// without removing anything
    pub async fn subtree_ids(&self, id: &str) -> Vec<String> {
        let contexts = self.contexts.lock().await;
        if !contexts.contains_key(id) {
            return Vec::new();
        }
        let mut order = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(ctx) = contexts.get(&current) {
                stack.extend(ctx.children.iter().cloned());
            }
            order.push(current);
        }
        order.reverse();
        order
    }

    /// Serialize the tree (or the subtree under `root`) for getTree
    pub async fn get_tree(&self, root: Option<&str>, max_depth: Option<u32>) -> Vec<ContextInfo> {
        let contexts = self.contexts.lock().await;

        fn build(
            contexts: &HashMap<String, BrowsingContext>,
            id: &str,
            depth_left: Option<u32>,
        ) -> Option<ContextInfo> {
            let ctx = contexts.get(id)?;
            let children = match depth_left {
                Some(0) => None,
                _ => Some(
                    ctx.children
                        .iter()
                        .filter_map(|child| {
                            build(contexts, child, depth_left.map(|d| d.saturating_sub(1)))
                        })
                        .collect(),
                ),
            };
            Some(ContextInfo {
                context: ctx.id.clone(),
                url: ctx.url.clone(),
                user_context: ctx.user_context.clone(),
                children,
                parent: ctx.parent.clone(),
            })
        }

        let roots: Vec<String> = match root {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids: Vec<String> = contexts
                    .values()
                    .filter(|c| c.parent.is_none())
                    .map(|c| c.id.clone())
                    .collect();
                ids.sort();
                ids
            }
        };

        roots
            .iter()
            .filter_map(|id| build(&contexts, id, max_depth))
            .collect()
    }
}

impl Default for BrowsingContextStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::stub_target;

    async fn storage_with_tree() -> BrowsingContextStorage {
        let storage = BrowsingContextStorage::new();
        let target = stub_target("sess-top");
        storage
            .insert(BrowsingContext::new(
                "top",
                None,
                DEFAULT_USER_CONTEXT,
                "about:blank",
                Arc::clone(&target),
            ))
            .await;
        storage
            .insert(BrowsingContext::new(
                "child-a",
                Some("top".into()),
                DEFAULT_USER_CONTEXT,
                "about:blank",
                Arc::clone(&target),
            ))
            .await;
        storage
            .insert(BrowsingContext::new(
                "grandchild",
                Some("child-a".into()),
                DEFAULT_USER_CONTEXT,
                "about:blank",
                target,
            ))
            .await;
        storage
    }

    #[tokio::test]
    async fn ancestor_walk_reaches_top_level() {
        let storage = storage_with_tree().await;
        assert_eq!(
            storage.ancestors("grandchild").await,
            vec!["grandchild", "child-a", "top"]
        );
        assert_eq!(storage.top_level_id("grandchild").await.as_deref(), Some("top"));
        assert!(storage.is_top_level("top").await);
        assert!(!storage.is_top_level("child-a").await);
    }

    #[tokio::test]
    async fn remove_subtree_is_bottom_up() {
        let storage = storage_with_tree().await;
        let removed = storage.remove_subtree("top").await;
        assert_eq!(removed.len(), 3);
        // Deepest context goes first so destruction events see no parent gaps
        assert_eq!(removed[0], "grandchild");
        assert_eq!(removed[2], "top");
        assert!(!storage.exists("child-a").await);
    }

    #[tokio::test]
    async fn remove_child_detaches_from_parent() {
        let storage = storage_with_tree().await;
        storage.remove_subtree("child-a").await;
        assert!(storage.exists("top").await);
        let tree = storage.get_tree(Some("top"), None).await;
        assert!(tree[0].children.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_by_session_matches_target() {
        let storage = storage_with_tree().await;
        let found = storage.find_by_session("sess-top").await;
        assert!(found.is_some());
        assert!(storage.find_by_session("sess-other").await.is_none());
    }

    #[tokio::test]
    async fn get_tree_respects_max_depth() {
        let storage = storage_with_tree().await;
        let tree = storage.get_tree(None, Some(1)).await;
        assert_eq!(tree.len(), 1);
        let children = tree[0].children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].children.is_none());
    }

    #[tokio::test]
    async fn navigation_epoch_advances() {
        let storage = storage_with_tree().await;
        let (epoch0, state0, _) = storage.navigation_progress("top").await.unwrap();
        assert_eq!(state0, ReadinessState::None);

        storage.begin_navigation("top", "loader-1").await;
        storage
            .set_ready_state("top", ReadinessState::Complete)
            .await;
        let (epoch1, state1, nav) = storage.navigation_progress("top").await.unwrap();
        assert_eq!(epoch1, epoch0 + 1);
        assert_eq!(state1, ReadinessState::Complete);
        assert_eq!(nav.as_deref(), Some("loader-1"));
    }
}
