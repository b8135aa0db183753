//! Event subscriptions
//!
//! A subscription pairs a set of event names (or whole modules) with a set of
//! context ids; an empty context set means global. Matching is tree-aware:
//! subscribing to a context covers its whole subtree, so an event matches if
//! any of its ancestors is subscribed.

use uuid::Uuid;

/// Modules whose events a client may subscribe to
pub const KNOWN_MODULES: &[&str] = &["browsingContext", "log", "network", "script", "cdp"];

/// The module part of an event name ("network.beforeRequestSent" -> "network")
pub fn module_of(event: &str) -> &str {
    event.split_once('.').map(|(module, _)| module).unwrap_or(event)
}

/// Whether an event name refers to a known module
pub fn is_known_event(event: &str) -> bool {
    KNOWN_MODULES.contains(&module_of(event))
}

/// One subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    /// Module names or fully qualified event names
    pub events: Vec<String>,
    /// None = global
    pub contexts: Option<Vec<String>>,
}

impl Subscription {
    fn covers_event(&self, event: &str) -> bool {
        let module = module_of(event);
        self.events.iter().any(|e| e == event || e == module)
    }

    fn covers_context(&self, ancestors: &[String]) -> bool {
        match &self.contexts {
            None => true,
            Some(contexts) => ancestors.iter().any(|a| contexts.contains(a)),
        }
    }
}

/// How a module is subscribed, for domain-enable decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleScope {
    NotSubscribed,
    Global,
    /// Subscribed for these context ids only
    Contexts(Vec<String>),
}

/// Which BiDi modules/events are subscribed, for which context subtrees
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription and return its id
    pub fn subscribe(&mut self, events: Vec<String>, contexts: Option<Vec<String>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions.push(Subscription {
            id: id.clone(),
            events,
            contexts,
        });
        id
    }

    /// Remove subscriptions by id. Fails (without removing anything) if any
    /// id is unknown, so a bad batch has no partial effect.
    pub fn unsubscribe(&mut self, ids: &[String]) -> Result<(), String> {
        for id in ids {
            if !self.subscriptions.iter().any(|s| &s.id == id) {
                return Err(id.clone());
            }
        }
        self.subscriptions.retain(|s| !ids.contains(&s.id));
        Ok(())
    }

    /// Whether an event with the given ancestor chain (event context first,
    /// root last; empty for context-less events) has a matching subscriber
    pub fn is_subscribed(&self, event: &str, ancestors: &[String]) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.covers_event(event) && s.covers_context(ancestors))
    }

    /// Aggregate scope of a module across all subscriptions
    pub fn module_scope(&self, module: &str) -> ModuleScope {
        let mut contexts: Vec<String> = Vec::new();
        let mut subscribed = false;
        for sub in &self.subscriptions {
            if !sub.events.iter().any(|e| e == module || module_of(e) == module) {
                continue;
            }
            subscribed = true;
            match &sub.contexts {
                None => return ModuleScope::Global,
                Some(ids) => {
                    for id in ids {
                        if !contexts.contains(id) {
                            contexts.push(id.clone());
                        }
                    }
                }
            }
        }
        if subscribed {
            ModuleScope::Contexts(contexts)
        } else {
            ModuleScope::NotSubscribed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn module_subscription_matches_every_event_in_module() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(vec!["network".into()], None);
        assert!(mgr.is_subscribed("network.beforeRequestSent", &chain(&["ctx"])));
        assert!(mgr.is_subscribed("network.responseCompleted", &[]));
        assert!(!mgr.is_subscribed("log.entryAdded", &chain(&["ctx"])));
    }

    #[test]
    fn exact_event_subscription() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(vec!["log.entryAdded".into()], None);
        assert!(mgr.is_subscribed("log.entryAdded", &[]));
        assert!(!mgr.is_subscribed("log.somethingElse", &[]));
    }

    #[test]
    fn context_subscription_covers_subtree() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(vec!["network".into()], Some(chain(&["top"])));

        // Event in a child frame: ancestors include the subscribed context
        assert!(mgr.is_subscribed("network.beforeRequestSent", &chain(&["frame", "top"])));
        // Event in an unrelated tree
        assert!(!mgr.is_subscribed("network.beforeRequestSent", &chain(&["other"])));
        // Context-less event does not match a scoped subscription
        assert!(!mgr.is_subscribed("network.beforeRequestSent", &[]));
    }

    #[test]
    fn unsubscribe_is_all_or_nothing() {
        let mut mgr = SubscriptionManager::new();
        let id = mgr.subscribe(vec!["network".into()], None);
        assert!(mgr
            .unsubscribe(&[id.clone(), "bogus".into()])
            .is_err());
        assert!(mgr.is_subscribed("network.beforeRequestSent", &[]));
        assert!(mgr.unsubscribe(&[id]).is_ok());
        assert!(!mgr.is_subscribed("network.beforeRequestSent", &[]));
    }

    #[test]
    fn module_scope_aggregation() {
        let mut mgr = SubscriptionManager::new();
        assert_eq!(mgr.module_scope("network"), ModuleScope::NotSubscribed);

        mgr.subscribe(vec!["network.beforeRequestSent".into()], Some(chain(&["a"])));
        mgr.subscribe(vec!["network".into()], Some(chain(&["b"])));
        assert_eq!(
            mgr.module_scope("network"),
            ModuleScope::Contexts(chain(&["a", "b"]))
        );

        mgr.subscribe(vec!["network".into()], None);
        assert_eq!(mgr.module_scope("network"), ModuleScope::Global);
    }

    #[test]
    fn event_name_validation() {
        assert!(is_known_event("network"));
        assert!(is_known_event("browsingContext.contextCreated"));
        assert!(!is_known_event("input.performActions"));
        assert_eq!(module_of("cdp.Network.loadingFinished"), "cdp");
    }
}
