//! Event queueing and delivery
//!
//! Every BiDi event funnels through the EventManager: if a matching
//! subscription exists the event goes straight to the outbound channel,
//! otherwise it is buffered (for the modules that buffer) and replayed when a
//! matching subscription appears. Delivery order equals registration order
//! per (context, module).

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::context::BrowsingContextStorage;
use crate::protocol::EventFrame;
use crate::subscription::{module_of, ModuleScope, SubscriptionManager};

/// Modules whose events are buffered before a subscriber exists
const BUFFERED_MODULES: &[&str] = &["log", "network"];

/// Buffered events kept per (module, context); oldest dropped beyond this
const BUFFER_LIMIT: usize = 1024;

struct BufferedEvent {
    seq: u64,
    method: String,
    context: Option<String>,
    ancestors: Vec<String>,
    params: Value,
}

struct Inner {
    subscriptions: SubscriptionManager,
    buffer: VecDeque<BufferedEvent>,
    next_seq: u64,
}

/// Queue, buffer, and dispatch BiDi events respecting subscriptions
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<Mutex<Inner>>,
    outbound: mpsc::Sender<String>,
    contexts: BrowsingContextStorage,
}

impl EventManager {
    pub fn new(outbound: mpsc::Sender<String>, contexts: BrowsingContextStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscriptions: SubscriptionManager::new(),
                buffer: VecDeque::new(),
                next_seq: 0,
            })),
            outbound,
            contexts,
        }
    }

    /// Register an event for delivery. The ancestor chain is resolved from
    /// live storage; events for already-disposed contexts are dropped.
    pub async fn register_event(&self, method: &str, context: Option<&str>, params: Value) {
        let ancestors = match context {
            Some(id) => {
                if !self.contexts.exists(id).await {
                    tracing::debug!("Dropping {} for disposed context {}", method, id);
                    return;
                }
                self.contexts.ancestors(id).await
            }
            None => Vec::new(),
        };
        self.register_with_ancestors(method, context, ancestors, params)
            .await;
    }

    /// Register an event with a pre-computed ancestor chain. Used on the
    /// disposal path, where the chain must be captured before the storage
    /// forgets the context.
    pub async fn register_with_ancestors(
        &self,
        method: &str,
        context: Option<&str>,
        ancestors: Vec<String>,
        params: Value,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.is_subscribed(method, &ancestors) {
            drop(inner);
            self.deliver(method, params).await;
            return;
        }

        let module = module_of(method);
        if !BUFFERED_MODULES.contains(&module) {
            tracing::trace!("No subscriber for {}, dropping", method);
            return;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.buffer.push_back(BufferedEvent {
            seq,
            method: method.to_string(),
            context: context.map(String::from),
            ancestors,
            params,
        });

        // Drop-oldest within this (module, context) bucket
        let count = inner
            .buffer
            .iter()
            .filter(|e| module_of(&e.method) == module && e.context.as_deref() == context)
            .count();
        if count > BUFFER_LIMIT {
            let oldest = inner
                .buffer
                .iter()
                .position(|e| module_of(&e.method) == module && e.context.as_deref() == context);
            if let Some(index) = oldest {
                let _ = inner.buffer.remove(index);
            }
        }
    }

    /// Add a subscription, then replay every buffered event it matches, in
    /// insertion order, before any later live event.
    pub async fn subscribe(
        &self,
        events: Vec<String>,
        contexts: Option<Vec<String>>,
    ) -> String {
        let mut inner = self.inner.lock().await;
        let id = inner.subscriptions.subscribe(events, contexts);

        let mut matched: Vec<BufferedEvent> = Vec::new();
        let mut kept: VecDeque<BufferedEvent> = VecDeque::new();
        while let Some(event) = inner.buffer.pop_front() {
            if inner
                .subscriptions
                .is_subscribed(&event.method, &event.ancestors)
            {
                matched.push(event);
            } else {
                kept.push_back(event);
            }
        }
        inner.buffer = kept;
        matched.sort_by_key(|e| e.seq);
        drop(inner);

        for event in matched {
            self.deliver(&event.method, event.params).await;
        }
        id
    }

    /// Remove subscriptions; all-or-nothing on unknown ids
    pub async fn unsubscribe(&self, ids: &[String]) -> Result<(), String> {
        self.inner.lock().await.subscriptions.unsubscribe(ids)
    }

    /// Drop buffered events of a disposed context so a later subscription
    /// cannot replay them past its contextDestroyed
    pub async fn drop_context_buffer(&self, context_id: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .buffer
            .retain(|e| e.context.as_deref() != Some(context_id));
    }

    /// Aggregate scope of a module, for CDP domain-enable decisions
    pub async fn module_scope(&self, module: &str) -> ModuleScope {
        self.inner.lock().await.subscriptions.module_scope(module)
    }

    async fn deliver(&self, method: &str, params: Value) {
        let frame = EventFrame::new(method, params);
        match serde_json::to_string(&frame) {
            Ok(text) => {
                if self.outbound.send(text).await.is_err() {
                    tracing::debug!("Outbound channel closed, dropping {}", method);
                }
            }
            Err(err) => tracing::warn!("Failed to serialize {}: {}", method, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BrowsingContext, DEFAULT_USER_CONTEXT};
    use crate::target::tests::stub_target;
    use serde_json::json;

    async fn setup() -> (EventManager, mpsc::Receiver<String>, BrowsingContextStorage) {
        let (tx, rx) = mpsc::channel(64);
        let contexts = BrowsingContextStorage::new();
        contexts
            .insert(BrowsingContext::new(
                "top",
                None,
                DEFAULT_USER_CONTEXT,
                "about:blank",
                stub_target("sess"),
            ))
            .await;
        let events = EventManager::new(tx, contexts.clone());
        (events, rx, contexts)
    }

    fn method_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["method"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn subscribed_event_is_delivered_immediately() {
        let (events, mut rx, _) = setup().await;
        events.subscribe(vec!["network".into()], None).await;
        events
            .register_event("network.beforeRequestSent", Some("top"), json!({"n": 1}))
            .await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(method_of(&frame), "network.beforeRequestSent");
    }

    #[tokio::test]
    async fn buffered_events_replay_on_subscribe_in_order() {
        let (events, mut rx, _) = setup().await;
        events
            .register_event("log.entryAdded", Some("top"), json!({"text": "first"}))
            .await;
        events
            .register_event("log.entryAdded", Some("top"), json!({"text": "second"}))
            .await;
        assert!(rx.try_recv().is_err());

        events.subscribe(vec!["log".into()], None).await;
        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["params"]["text"], "first");
        assert_eq!(second["params"]["text"], "second");
    }

    #[tokio::test]
    async fn buffered_events_are_replayed_once() {
        let (events, mut rx, _) = setup().await;
        events
            .register_event("log.entryAdded", Some("top"), json!({}))
            .await;
        events.subscribe(vec!["log".into()], None).await;
        assert!(rx.recv().await.is_some());

        // A second subscription must not see the already-delivered event
        events.subscribe(vec!["log".into()], Some(vec!["top".into()])).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_buffered_modules_are_dropped_without_subscriber() {
        let (events, mut rx, _) = setup().await;
        events
            .register_event("browsingContext.contextCreated", Some("top"), json!({}))
            .await;
        events.subscribe(vec!["browsingContext".into()], None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disposed_context_buffer_is_purged() {
        let (events, mut rx, contexts) = setup().await;
        events
            .register_event("log.entryAdded", Some("top"), json!({}))
            .await;
        contexts.remove_subtree("top").await;
        events.drop_context_buffer("top").await;

        // A later subscription must not replay past the disposal
        events.subscribe(vec!["log".into()], None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_for_disposed_contexts_are_dropped() {
        let (events, mut rx, contexts) = setup().await;
        events.subscribe(vec!["network".into()], None).await;
        contexts.remove_subtree("top").await;
        events
            .register_event("network.responseCompleted", Some("top"), json!({}))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scoped_subscription_sees_subtree_events_only() {
        let (events, mut rx, contexts) = setup().await;
        contexts
            .insert(BrowsingContext::new(
                "frame",
                Some("top".into()),
                DEFAULT_USER_CONTEXT,
                "about:blank",
                stub_target("sess"),
            ))
            .await;
        events
            .subscribe(vec!["network".into()], Some(vec!["top".into()]))
            .await;

        events
            .register_event("network.beforeRequestSent", Some("frame"), json!({"hit": 1}))
            .await;
        assert!(rx.recv().await.is_some());

        contexts
            .insert(BrowsingContext::new(
                "stranger",
                None,
                DEFAULT_USER_CONTEXT,
                "about:blank",
                stub_target("sess2"),
            ))
            .await;
        events
            .register_event("network.beforeRequestSent", Some("stranger"), json!({"hit": 2}))
            .await;
        assert!(rx.try_recv().is_err());
    }
}
