//! Execution realms
//!
//! A realm is one JavaScript execution environment: the default world of a
//! frame, a sandboxed isolated world, or a worker. Realms are indexed by
//! their own id, by execution-context id, by browsing context and by CDP
//! session so every lifecycle signal can find them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

/// What kind of execution environment a realm is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealmKind {
    Window {
        /// Isolated-world name; None for the default world
        sandbox: Option<String>,
    },
    DedicatedWorker,
    SharedWorker,
    ServiceWorker,
}

impl RealmKind {
    /// The BiDi realm type string
    pub fn as_str(&self) -> &'static str {
        match self {
            RealmKind::Window { .. } => "window",
            RealmKind::DedicatedWorker => "dedicated-worker",
            RealmKind::SharedWorker => "shared-worker",
            RealmKind::ServiceWorker => "service-worker",
        }
    }
}

/// One execution realm
#[derive(Debug, Clone)]
pub struct Realm {
    pub id: String,
    pub origin: String,
    pub execution_context_id: u64,
    pub session_id: String,
    /// Browsing context for window realms, None for workers
    pub context_id: Option<String>,
    pub kind: RealmKind,
    /// Parent realm ids; non-empty for dedicated workers only
    pub owners: Vec<String>,
}

impl Realm {
    pub fn new(
        origin: impl Into<String>,
        execution_context_id: u64,
        session_id: impl Into<String>,
        context_id: Option<String>,
        kind: RealmKind,
        owners: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin: origin.into(),
            execution_context_id,
            session_id: session_id.into(),
            context_id,
            kind,
            owners,
        }
    }

    /// Whether this is the default window realm of its context
    pub fn is_default(&self) -> bool {
        matches!(&self.kind, RealmKind::Window { sandbox: None })
    }
}

/// Index of live realms
#[derive(Clone)]
pub struct RealmStorage {
    realms: Arc<Mutex<HashMap<String, Realm>>>,
}

impl RealmStorage {
    pub fn new() -> Self {
        Self {
            realms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert a realm. A context has at most one default realm at a time, so
    /// inserting a new default replaces the old one; the replaced realm is
    /// returned so its destruction can be announced.
    pub async fn insert(&self, realm: Realm) -> Option<Realm> {
        let mut realms = self.realms.lock().await;
        let mut replaced = None;
        if realm.is_default() {
            if let Some(context_id) = &realm.context_id {
                let stale: Option<String> = realms
                    .values()
                    .find(|r| r.is_default() && r.context_id.as_ref() == Some(context_id))
                    .map(|r| r.id.clone());
                if let Some(id) = stale {
                    replaced = realms.remove(&id);
                }
            }
        }
        realms.insert(realm.id.clone(), realm);
        replaced
    }

    pub async fn get(&self, id: &str) -> Option<Realm> {
        self.realms.lock().await.get(id).cloned()
    }

    pub async fn find_by_execution_context(
        &self,
        session_id: &str,
        execution_context_id: u64,
    ) -> Option<Realm> {
        let realms = self.realms.lock().await;
        realms
            .values()
            .find(|r| {
                r.session_id == session_id && r.execution_context_id == execution_context_id
            })
            .cloned()
    }

    /// Any realm living on the given session; used to resolve the owner of a
    /// freshly attached worker target
    pub async fn find_by_session(&self, session_id: &str) -> Option<Realm> {
        let realms = self.realms.lock().await;
        realms
            .values()
            .find(|r| r.session_id == session_id)
            .cloned()
    }

    /// Remove every realm bound to a session (detach, crash)
    pub async fn remove_by_session(&self, session_id: &str) -> Vec<Realm> {
        self.remove_where(|r| r.session_id == session_id).await
    }

    /// Remove every realm of a browsing context (navigation, disposal)
    pub async fn remove_by_context(&self, context_id: &str) -> Vec<Realm> {
        self.remove_where(|r| r.context_id.as_deref() == Some(context_id))
            .await
    }

    pub async fn remove_by_execution_context(
        &self,
        session_id: &str,
        execution_context_id: u64,
    ) -> Option<Realm> {
        self.remove_where(|r| {
            r.session_id == session_id && r.execution_context_id == execution_context_id
        })
        .await
        .into_iter()
        .next()
    }

    async fn remove_where(&self, predicate: impl Fn(&Realm) -> bool) -> Vec<Realm> {
        let mut realms = self.realms.lock().await;
        let ids: Vec<String> = realms
            .values()
            .filter(|r| predicate(r))
            .map(|r| r.id.clone())
            .collect();
        ids.iter().filter_map(|id| realms.remove(id)).collect()
    }
}

impl Default for RealmStorage {
    fn default() -> Self {
        Self::new()
    }
}
