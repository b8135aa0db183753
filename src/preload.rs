//! Preload scripts
//!
//! Scripts installed to run on every new document before any page script.
//! Each script is global or scoped to named top-level contexts, and carries
//! the per-target CDP identifiers handed back by
//! `Page.addScriptToEvaluateOnNewDocument` so removal can find them again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

/// A stored preload script
#[derive(Debug, Clone)]
pub struct PreloadScript {
    pub id: String,
    /// Wrapped source, ready for Page.addScriptToEvaluateOnNewDocument
    pub source: String,
    pub sandbox: Option<String>,
    /// Channel ids referenced by the script's arguments
    pub channels: Vec<String>,
    /// Top-level context ids this script targets; None = every target
    pub contexts: Option<Vec<String>>,
    /// target id -> CDP script identifier
    pub cdp_ids: HashMap<String, String>,
}

impl PreloadScript {
    pub fn new(
        function_declaration: &str,
        sandbox: Option<String>,
        channels: Vec<String>,
        contexts: Option<Vec<String>>,
    ) -> Self {
        // Invoke the declaration as an IIFE so arrow functions and function
        // expressions both work
        let source = format!("({function_declaration})();");
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            sandbox,
            channels,
            contexts,
            cdp_ids: HashMap::new(),
        }
    }

    /// Whether this script should be installed on the given top-level context
    pub fn matches(&self, top_level_id: &str) -> bool {
        match &self.contexts {
            None => true,
            Some(contexts) => contexts.iter().any(|c| c == top_level_id),
        }
    }
}

/// Storage for global and per-context preload scripts
#[derive(Clone)]
pub struct PreloadScriptStorage {
    scripts: Arc<Mutex<HashMap<String, PreloadScript>>>,
}

impl PreloadScriptStorage {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, script: PreloadScript) {
        self.scripts.lock().await.insert(script.id.clone(), script);
    }

    pub async fn remove(&self, id: &str) -> Option<PreloadScript> {
        self.scripts.lock().await.remove(id)
    }

    /// Scripts that must be installed on a new target, insertion order not
    /// guaranteed (install order does not matter, all run before user code)
    pub async fn matching(&self, top_level_id: &str) -> Vec<PreloadScript> {
        self.scripts
            .lock()
            .await
            .values()
            .filter(|s| s.matches(top_level_id))
            .cloned()
            .collect()
    }

    /// Record the CDP identifier a target assigned to a script
    pub async fn record_cdp_id(&self, script_id: &str, target_id: &str, cdp_id: String) {
        if let Some(script) = self.scripts.lock().await.get_mut(script_id) {
            script.cdp_ids.insert(target_id.to_string(), cdp_id);
        }
    }

    /// Drop every binding to a target that went away
    pub async fn remove_target_bindings(&self, target_id: &str) {
        for script in self.scripts.lock().await.values_mut() {
            script.cdp_ids.remove(target_id);
        }
    }
}

impl Default for PreloadScriptStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_script_matches_every_target() {
        let script = PreloadScript::new("() => {}", None, Vec::new(), None);
        assert!(script.matches("t1"));
        assert!(script.matches("t2"));
        assert_eq!(script.source, "(() => {})();");
    }

    #[tokio::test]
    async fn scoped_script_matches_named_contexts_only() {
        let script = PreloadScript::new(
            "() => {}",
            None,
            Vec::new(),
            Some(vec!["t1".to_string()]),
        );
        assert!(script.matches("t1"));
        assert!(!script.matches("t2"));
    }

    #[tokio::test]
    async fn target_bindings_are_dropped_on_detach() {
        let storage = PreloadScriptStorage::new();
        let script = PreloadScript::new("() => {}", None, Vec::new(), None);
        let id = script.id.clone();
        storage.insert(script).await;

        storage.record_cdp_id(&id, "t1", "cdp-7".into()).await;
        storage.record_cdp_id(&id, "t2", "cdp-8".into()).await;
        storage.remove_target_bindings("t1").await;

        let script = storage.remove(&id).await.unwrap();
        assert!(!script.cdp_ids.contains_key("t1"));
        assert_eq!(script.cdp_ids.get("t2").map(String::as_str), Some("cdp-8"));
    }
}
