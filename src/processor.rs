//! Command and event processing
//!
//! The processor reacts to every CDP event the connection fans in, keeps the
//! storages consistent, and implements the BiDi command surface. All state
//! changes derived from one CDP event complete before the matching BiDi
//! event is registered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::cdp::types::{
    AttachedToTargetEvent, CdpEvent, CdpEventEnvelope, ConsoleApiCalledEvent,
    DetachedFromTargetEvent, EmulationClearDeviceMetricsOverride,
    EmulationSetDeviceMetricsOverride, ExecutionContextCreatedEvent,
    ExecutionContextDestroyedEvent, FrameAttachedEvent, FrameDetachedEvent, FrameNavigatedEvent,
    JavascriptDialogOpeningEvent, LifecycleEvent, PageHandleJavaScriptDialog, PageNavigate,
    PageNavigateResult, PageRemoveScriptToEvaluateOnNewDocument, RuntimeRunIfWaitingForDebugger,
    TargetCloseTarget, TargetCreateTarget, TargetCreateTargetResult, TargetDetachFromTarget,
    TargetInfo, TargetSetAutoAttach, TargetSetDiscoverTargets,
};
use crate::cdp::{CdpClient, CdpConnection};
use crate::context::{BrowsingContext, BrowsingContextStorage, DEFAULT_USER_CONTEXT};
use crate::error::{CommandError, CommandResult, Error, Result};
use crate::event::EventManager;
use crate::network::{FetchStages, NetworkStorage};
use crate::preload::{PreloadScript, PreloadScriptStorage};
use crate::protocol::{
    AddInterceptParams, AddInterceptResult, AddPreloadScriptParams, AddPreloadScriptResult,
    ChannelValue, CloseParams, ContinueRequestParams, ContinueResponseParams,
    ContinueWithAuthParams, CreateParams, CreateResult, CdpSendCommandParams,
    CdpSendCommandResult, CreateType, FailRequestParams, GetTreeParams, GetTreeResult,
    HandleUserPromptParams, NavigateParams, NavigateResult, ProvideResponseParams,
    ReadinessState, RemoveInterceptParams, RemovePreloadScriptParams, SetViewportParams,
    SubscribeParams, SubscribeResult, UnsubscribeParams,
};
use crate::realm::{Realm, RealmKind, RealmStorage};
use crate::subscription::{is_known_event, ModuleScope};
use crate::target::{CdpTarget, TargetKind};

/// How long a close waits for the detach before proceeding anyway
const CLOSE_DETACH_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval for waits resolved by event processing
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session-level options the front-end negotiated
#[derive(Debug, Clone, Default)]
pub struct MapperOptions {
    /// The mapper's own target id; attaches to it are released untouched so
    /// the mapper never introspects itself
    pub self_target_id: Option<String>,
    pub accept_insecure_certs: bool,
    /// CDP id of the default browser context, mapped to the "default"
    /// user-context sentinel
    pub default_user_context_id: Option<String>,
}

/// A worker target and the realm shape its execution context will take
struct WorkerEntry {
    target: Arc<CdpTarget>,
    kind: RealmKind,
    owners: Vec<String>,
}

/// Dispatches commands and reacts to Target/Page/Network events
#[derive(Clone)]
pub struct BrowsingContextProcessor {
    connection: Arc<CdpConnection>,
    browser_client: CdpClient,
    contexts: BrowsingContextStorage,
    realms: RealmStorage,
    preload: PreloadScriptStorage,
    network: NetworkStorage,
    events: EventManager,
    workers: Arc<Mutex<HashMap<String, WorkerEntry>>>,
    options: Arc<MapperOptions>,
}

impl BrowsingContextProcessor {
    pub fn new(
        connection: Arc<CdpConnection>,
        events: EventManager,
        contexts: BrowsingContextStorage,
        realms: RealmStorage,
        preload: PreloadScriptStorage,
        network: NetworkStorage,
        options: MapperOptions,
    ) -> Self {
        let browser_client = connection.browser_client();
        Self {
            connection,
            browser_client,
            contexts,
            realms,
            preload,
            network,
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
            options: Arc::new(options),
        }
    }

    /// Start target discovery and auto-attach on the browser session
    pub async fn initialize(&self) -> Result<()> {
        self.browser_client
            .send_command::<_, Value>(
                "Target.setDiscoverTargets",
                &TargetSetDiscoverTargets { discover: true },
            )
            .await?;
        self.browser_client
            .send_command::<_, Value>(
                "Target.setAutoAttach",
                &TargetSetAutoAttach {
                    auto_attach: true,
                    wait_for_debugger_on_start: true,
                    flatten: true,
                },
            )
            .await?;
        Ok(())
    }

    // =====================================================================
    // CDP event handling
    // =====================================================================

    /// Single entry point for every CDP event. Never throws back into the
    /// transport; failures are logged and the event dropped.
    pub async fn handle_cdp_event(&self, envelope: CdpEventEnvelope) {
        let session = envelope.session_id.clone();
        match envelope.event {
            CdpEvent::AttachedToTarget(ev) => self.on_attached_to_target(session, ev).await,
            CdpEvent::DetachedFromTarget(ev) => self.on_detached_from_target(ev).await,
            CdpEvent::TargetCrashed => {
                if let Some(session) = session {
                    self.remove_session_realms(&session).await;
                }
            }
            CdpEvent::FrameAttached(ev) => self.on_frame_attached(ev).await,
            CdpEvent::FrameDetached(ev) => self.on_frame_detached(ev).await,
            CdpEvent::FrameNavigated(ev) => self.on_frame_navigated(ev).await,
            CdpEvent::Lifecycle(ev) => self.on_lifecycle(ev).await,
            CdpEvent::DialogOpening(ev) => self.on_dialog_opening(session, ev).await,
            CdpEvent::ExecutionContextCreated(ev) => {
                self.on_execution_context_created(session, ev).await
            }
            CdpEvent::ExecutionContextDestroyed(ev) => {
                self.on_execution_context_destroyed(session, ev).await
            }
            CdpEvent::ExecutionContextsCleared => {
                if let Some(session) = session {
                    self.remove_session_realms(&session).await;
                }
            }
            CdpEvent::ConsoleApiCalled(ev) => self.on_console_api_called(session, ev).await,
            CdpEvent::RequestWillBeSent(ev) => {
                self.network
                    .on_request_will_be_sent(self.client_for(session.as_deref()), ev)
                    .await
            }
            CdpEvent::RequestWillBeSentExtraInfo(ev) => {
                self.network.on_request_extra_info(ev).await
            }
            CdpEvent::ResponseReceived(ev) => {
                self.network
                    .on_response_received(self.client_for(session.as_deref()), ev)
                    .await
            }
            CdpEvent::ResponseReceivedExtraInfo(ev) => {
                self.network.on_response_extra_info(ev).await
            }
            CdpEvent::LoadingFinished(ev) => {
                let session = self.network.on_loading_finished(ev).await;
                self.after_request_terminal(session).await;
            }
            CdpEvent::LoadingFailed(ev) => {
                let session = self.network.on_loading_failed(ev).await;
                self.after_request_terminal(session).await;
            }
            CdpEvent::RequestServedFromCache(ev) => self.network.on_served_from_cache(ev).await,
            CdpEvent::RequestPaused(ev) => {
                self.network
                    .on_request_paused(self.client_for(session.as_deref()), ev)
                    .await
            }
            CdpEvent::AuthRequired(ev) => {
                self.network
                    .on_auth_required(self.client_for(session.as_deref()), ev)
                    .await
            }
            CdpEvent::Other { method, params } => {
                // Generic tunnel for everything the mapper has no model for
                self.events
                    .register_event(
                        &format!("cdp.{method}"),
                        None,
                        json!({"event": method, "params": params, "session": session}),
                    )
                    .await;
            }
        }
    }

    fn client_for(&self, session: Option<&str>) -> CdpClient {
        match session {
            Some(session) => self.connection.session_client(session),
            None => self.browser_client.clone(),
        }
    }

    async fn on_attached_to_target(&self, parent_session: Option<String>, ev: AttachedToTargetEvent) {
        let info = &ev.target_info;

        if self.options.self_target_id.as_deref() == Some(info.target_id.as_str()) {
            self.release_and_detach(&ev.session_id).await;
            return;
        }

        match info.r#type.as_str() {
            "page" | "iframe" | "tab" => self.attach_page_target(&ev.session_id, info).await,
            "worker" | "service_worker" => {
                self.attach_worker_target(parent_session, &ev.session_id, info)
                    .await
            }
            "shared_worker" => {
                self.register_worker(&ev.session_id, info, RealmKind::SharedWorker, Vec::new())
                    .await
            }
            other => {
                tracing::debug!("Releasing unsupported target type {}", other);
                self.release_and_detach(&ev.session_id).await;
            }
        }
    }

    async fn attach_page_target(&self, session_id: &str, info: &TargetInfo) {
        let client = self.connection.session_client(session_id);
        let target = CdpTarget::new(
            &info.target_id,
            session_id,
            TargetKind::Page,
            client,
            self.options.accept_insecure_certs,
        );

        if self.contexts.exists(&info.target_id).await {
            // OOPIF swap: the context keeps its id, children and
            // subscriptions; only the owning target changes
            self.contexts
                .rebind_target(&info.target_id, Arc::clone(&target))
                .await;
        } else {
            let user_context = match &info.browser_context_id {
                Some(id) if self.options.default_user_context_id.as_deref() != Some(id) => {
                    id.clone()
                }
                _ => DEFAULT_USER_CONTEXT.to_string(),
            };
            let context = BrowsingContext::new(
                &info.target_id,
                None,
                user_context,
                &info.url,
                Arc::clone(&target),
            );
            self.contexts.insert(context).await;
            self.emit_context_event("browsingContext.contextCreated", &info.target_id)
                .await;
        }

        let top_level = self
            .contexts
            .top_level_id(&info.target_id)
            .await
            .unwrap_or_else(|| info.target_id.clone());
        let network_wanted = self.network_wanted(&top_level).await;
        let stages = self.network.interception_stages(&top_level).await;
        target
            .unblock(&self.preload, &top_level, network_wanted, stages)
            .await;
    }

    async fn attach_worker_target(
        &self,
        parent_session: Option<String>,
        session_id: &str,
        info: &TargetInfo,
    ) {
        // The attach arrives on the parent's session; the owning realm lives
        // there. No realm means the worker already terminated.
        let owner = match parent_session {
            Some(parent) => self.realms.find_by_session(&parent).await,
            None => None,
        };
        let Some(owner) = owner else {
            tracing::debug!("Worker {} has no owner realm, ignoring", info.target_id);
            self.release_and_detach(session_id).await;
            return;
        };
        let kind = if info.r#type == "service_worker" {
            RealmKind::ServiceWorker
        } else {
            RealmKind::DedicatedWorker
        };
        self.register_worker(session_id, info, kind, vec![owner.id]).await;
    }

    async fn register_worker(
        &self,
        session_id: &str,
        info: &TargetInfo,
        kind: RealmKind,
        owners: Vec<String>,
    ) {
        let client = self.connection.session_client(session_id);
        let target = CdpTarget::new(
            &info.target_id,
            session_id,
            TargetKind::Worker,
            client,
            self.options.accept_insecure_certs,
        );
        self.workers.lock().await.insert(
            session_id.to_string(),
            WorkerEntry {
                target: Arc::clone(&target),
                kind,
                owners,
            },
        );
        target
            .unblock(&self.preload, info.target_id.as_str(), false, FetchStages::default())
            .await;
    }

    /// Release the debugger and drop the session; for targets the mapper
    /// refuses to own
    async fn release_and_detach(&self, session_id: &str) {
        let client = self.connection.session_client(session_id);
        let _ = client
            .send_command::<_, Value>(
                "Runtime.runIfWaitingForDebugger",
                &RuntimeRunIfWaitingForDebugger {},
            )
            .await;
        let _ = self
            .browser_client
            .send_command::<_, Value>(
                "Target.detachFromTarget",
                &TargetDetachFromTarget {
                    session_id: session_id.to_string(),
                },
            )
            .await;
    }

    async fn on_detached_from_target(&self, ev: DetachedFromTargetEvent) {
        if let Some(context_id) = self.contexts.find_by_session(&ev.session_id).await {
            // Requests first: their contexts must still resolve for the
            // terminal fetchError events
            self.network.dispose_session(&ev.session_id).await;
            if let Some(target) = self.contexts.target_of(&context_id).await {
                self.preload
                    .remove_target_bindings(target.target_id())
                    .await;
            }
            self.dispose_context(&context_id).await;
            return;
        }
        if let Some(worker) = self.workers.lock().await.remove(&ev.session_id) {
            tracing::debug!("Worker target {} detached", worker.target.target_id());
        }
        self.remove_session_realms(&ev.session_id).await;
    }

    async fn on_frame_attached(&self, ev: FrameAttachedEvent) {
        let Some(parent_user_context) = self.contexts.user_context_of(&ev.parent_frame_id).await
        else {
            return;
        };
        let Some(target) = self.contexts.target_of(&ev.parent_frame_id).await else {
            return;
        };
        let context = BrowsingContext::new(
            &ev.frame_id,
            Some(ev.parent_frame_id.clone()),
            parent_user_context,
            "about:blank",
            target,
        );
        self.contexts.insert(context).await;
        self.emit_context_event("browsingContext.contextCreated", &ev.frame_id)
            .await;
    }

    async fn on_frame_detached(&self, ev: FrameDetachedEvent) {
        // OOPIF handoff: the frame becomes its own target and re-attaches
        if ev.reason.as_deref() == Some("swap") {
            return;
        }
        if self.contexts.exists(&ev.frame_id).await {
            self.dispose_context(&ev.frame_id).await;
        }
    }

    async fn on_frame_navigated(&self, ev: FrameNavigatedEvent) {
        if !self.contexts.exists(&ev.frame.id).await {
            return;
        }
        self.contexts.set_url(&ev.frame.id, &ev.frame.url).await;
        // A navigation invalidates every realm of the context before new
        // ones are created
        for realm in self.realms.remove_by_context(&ev.frame.id).await {
            self.emit_realm_destroyed(&realm).await;
        }
    }

    async fn on_lifecycle(&self, ev: LifecycleEvent) {
        if !self.contexts.exists(&ev.frame_id).await {
            return;
        }
        match ev.name.as_str() {
            "init" => {
                self.contexts
                    .begin_navigation(&ev.frame_id, &ev.loader_id)
                    .await;
            }
            "DOMContentLoaded" => {
                self.contexts
                    .set_ready_state(&ev.frame_id, ReadinessState::Interactive)
                    .await;
                self.emit_navigation_event("browsingContext.domContentLoaded", &ev.frame_id)
                    .await;
            }
            "load" => {
                self.contexts
                    .set_ready_state(&ev.frame_id, ReadinessState::Complete)
                    .await;
                self.emit_navigation_event("browsingContext.load", &ev.frame_id)
                    .await;
            }
            _ => {}
        }
    }

    async fn on_dialog_opening(&self, session: Option<String>, ev: JavascriptDialogOpeningEvent) {
        let Some(session) = session else { return };
        let Some(context) = self.contexts.find_by_session(&session).await else {
            return;
        };
        let mut params = json!({
            "context": context,
            "type": ev.r#type,
            "message": ev.message,
        });
        if let Some(default_prompt) = ev.default_prompt {
            params["defaultValue"] = json!(default_prompt);
        }
        self.events
            .register_event("browsingContext.userPromptOpened", Some(&context), params)
            .await;
    }

    async fn on_execution_context_created(
        &self,
        session: Option<String>,
        ev: ExecutionContextCreatedEvent,
    ) {
        let Some(session) = session else { return };

        // A context on a worker session materialises the worker realm
        let worker = {
            let workers = self.workers.lock().await;
            workers
                .get(&session)
                .map(|w| (w.kind.clone(), w.owners.clone()))
        };
        if let Some((kind, owners)) = worker {
            let realm = Realm::new(
                ev.context.origin.clone(),
                ev.context.id,
                session,
                None,
                kind,
                owners,
            );
            self.realms.insert(realm.clone()).await;
            self.emit_realm_created(&realm).await;
            return;
        }

        let Some(aux) = &ev.context.aux_data else { return };
        let Some(frame_id) = &aux.frame_id else { return };
        if !self.contexts.exists(frame_id).await {
            return;
        }
        let sandbox = if aux.is_default {
            None
        } else {
            Some(ev.context.name.clone())
        };
        let realm = Realm::new(
            ev.context.origin.clone(),
            ev.context.id,
            session,
            Some(frame_id.clone()),
            RealmKind::Window { sandbox },
            Vec::new(),
        );
        if let Some(replaced) = self.realms.insert(realm.clone()).await {
            self.emit_realm_destroyed(&replaced).await;
        }
        self.emit_realm_created(&realm).await;
    }

    async fn on_execution_context_destroyed(
        &self,
        session: Option<String>,
        ev: ExecutionContextDestroyedEvent,
    ) {
        let Some(session) = session else { return };
        if let Some(realm) = self
            .realms
            .remove_by_execution_context(&session, ev.execution_context_id)
            .await
        {
            self.emit_realm_destroyed(&realm).await;
        }
    }

    async fn on_console_api_called(&self, session: Option<String>, ev: ConsoleApiCalledEvent) {
        let realm = match (&session, ev.execution_context_id) {
            (Some(session), Some(id)) => {
                self.realms.find_by_execution_context(session, id).await
            }
            _ => None,
        };
        let context = realm.as_ref().and_then(|r| r.context_id.clone());

        let level = match ev.r#type.as_str() {
            "error" | "assert" => "error",
            "warning" => "warn",
            "debug" => "debug",
            _ => "info",
        };
        let text = ev
            .args
            .iter()
            .map(|arg| {
                arg.description
                    .clone()
                    .or_else(|| arg.value.as_ref().map(value_to_text))
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(" ");

        let params = json!({
            "type": "console",
            "level": level,
            "method": ev.r#type,
            "text": text,
            "timestamp": ev.timestamp,
            "source": {
                "realm": realm.as_ref().map(|r| r.id.clone()),
                "context": context,
            },
        });
        self.events
            .register_event("log.entryAdded", context.as_deref(), params)
            .await;
    }

    /// Re-check a deferred Fetch.disable once a request reached a terminal
    /// phase on its session
    async fn after_request_terminal(&self, session: Option<String>) {
        let Some(session) = session else { return };
        let Some(context_id) = self.contexts.find_by_session(&session).await else {
            return;
        };
        let Some(target) = self.contexts.target_of(&context_id).await else {
            return;
        };
        let still_paused = self.network.has_paused_for_session(&session).await;
        if let Err(err) = target.flush_fetch_disable(still_paused).await {
            if !err.is_close() {
                tracing::warn!("Deferred Fetch.disable failed: {}", err);
            }
        }
    }

    /// Remove a subtree and announce each destroyed context bottom-up, after
    /// the storage already forgot them
    async fn dispose_context(&self, id: &str) {
        let order = self.contexts.subtree_ids(id).await;
        let mut captured = Vec::new();
        for ctx_id in &order {
            let info = self.contexts.info_of(ctx_id).await;
            let ancestors = self.contexts.ancestors(ctx_id).await;
            captured.push((ctx_id.clone(), info, ancestors));
        }

        self.contexts.remove_subtree(id).await;

        for (ctx_id, info, ancestors) in captured {
            for realm in self.realms.remove_by_context(&ctx_id).await {
                // The storage already forgot the context; bypass the
                // liveness check with the captured chain
                self.events
                    .register_with_ancestors(
                        "script.realmDestroyed",
                        Some(&ctx_id),
                        ancestors.clone(),
                        json!({"realm": realm.id}),
                    )
                    .await;
            }
            if let Some(info) = info {
                self.events
                    .register_with_ancestors(
                        "browsingContext.contextDestroyed",
                        Some(&ctx_id),
                        ancestors,
                        serde_json::to_value(info).unwrap_or_default(),
                    )
                    .await;
            }
            self.events.drop_context_buffer(&ctx_id).await;
        }
    }

    async fn remove_session_realms(&self, session_id: &str) {
        for realm in self.realms.remove_by_session(session_id).await {
            self.emit_realm_destroyed(&realm).await;
        }
    }

    async fn emit_context_event(&self, method: &str, context_id: &str) {
        if let Some(info) = self.contexts.info_of(context_id).await {
            self.events
                .register_event(
                    method,
                    Some(context_id),
                    serde_json::to_value(info).unwrap_or_default(),
                )
                .await;
        }
    }

    async fn emit_navigation_event(&self, method: &str, context_id: &str) {
        let Some(info) = self.contexts.info_of(context_id).await else {
            return;
        };
        let navigation = self
            .contexts
            .navigation_progress(context_id)
            .await
            .and_then(|(_, _, nav)| nav);
        let params = json!({
            "context": context_id,
            "navigation": navigation,
            "url": info.url,
        });
        self.events
            .register_event(method, Some(context_id), params)
            .await;
    }

    async fn emit_realm_created(&self, realm: &Realm) {
        let mut params = json!({
            "realm": realm.id,
            "origin": realm.origin,
            "type": realm.kind.as_str(),
        });
        if let Some(context) = &realm.context_id {
            params["context"] = json!(context);
        }
        if let RealmKind::Window {
            sandbox: Some(sandbox),
        } = &realm.kind
        {
            params["sandbox"] = json!(sandbox);
        }
        self.events
            .register_event("script.realmCreated", realm.context_id.as_deref(), params)
            .await;
    }

    async fn emit_realm_destroyed(&self, realm: &Realm) {
        self.events
            .register_event(
                "script.realmDestroyed",
                realm.context_id.as_deref(),
                json!({"realm": realm.id}),
            )
            .await;
    }

    async fn network_wanted(&self, top_level: &str) -> bool {
        match self.events.module_scope("network").await {
            ModuleScope::NotSubscribed => false,
            ModuleScope::Global => true,
            ModuleScope::Contexts(ids) => {
                for id in ids {
                    if self.contexts.top_level_id(&id).await.as_deref() == Some(top_level) {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Re-run the network/fetch domain decision on every target
    pub async fn sync_targets_network(&self) {
        for target in self.contexts.all_targets().await {
            let top_level = self
                .contexts
                .top_level_id(target.target_id())
                .await
                .unwrap_or_else(|| target.target_id().to_string());
            let wanted = self.network_wanted(&top_level).await;
            let stages = self.network.interception_stages(&top_level).await;
            let paused = self
                .network
                .has_paused_for_session(target.session_id())
                .await;
            if let Err(err) = target.sync_network_domains(wanted, stages, paused).await {
                if !err.is_close() {
                    tracing::warn!(
                        "Network sync failed on {}: {}",
                        target.target_id(),
                        err
                    );
                }
            }
        }
    }

    // =====================================================================
    // session.*
    // =====================================================================

    pub async fn subscribe(&self, params: SubscribeParams) -> CommandResult {
        if params.events.is_empty() {
            return Err(CommandError::invalid_argument("events must not be empty"));
        }
        for event in &params.events {
            if !is_known_event(event) {
                return Err(CommandError::invalid_argument(format!(
                    "Unknown event '{event}'"
                )));
            }
        }
        if let Some(contexts) = &params.contexts {
            for context in contexts {
                if !self.contexts.exists(context).await {
                    return Err(CommandError::no_such_frame(context));
                }
            }
        }
        let subscription = self.events.subscribe(params.events, params.contexts).await;
        self.sync_targets_network().await;
        Ok(serde_json::to_value(SubscribeResult { subscription }).unwrap_or_default())
    }

    pub async fn unsubscribe(&self, params: UnsubscribeParams) -> CommandResult {
        self.events
            .unsubscribe(&params.subscriptions)
            .await
            .map_err(|id| {
                CommandError::invalid_argument(format!("No subscription with id '{id}'"))
            })?;
        self.sync_targets_network().await;
        Ok(json!({}))
    }

    // =====================================================================
    // browsingContext.*
    // =====================================================================

    pub async fn context_create(&self, params: CreateParams) -> CommandResult {
        let browser_context_id = params
            .user_context
            .filter(|u| u.as_str() != DEFAULT_USER_CONTEXT);
        let result: TargetCreateTargetResult = self
            .browser_client
            .send_command(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: "about:blank".into(),
                    new_window: Some(params.r#type == CreateType::Window),
                    browser_context_id,
                },
            )
            .await
            .map_err(|err| match &err {
                Error::Cdp { message, .. } if message.contains("Failed to find browser context") => {
                    CommandError::new(
                        crate::error::ErrorCode::NoSuchUserContext,
                        message.clone(),
                    )
                }
                _ => CommandError::from(err),
            })?;

        // The context appears and loads through event processing
        loop {
            if self.contexts.exists(&result.target_id).await {
                if let Some((_, state, _)) =
                    self.contexts.navigation_progress(&result.target_id).await
                {
                    if state == ReadinessState::Complete {
                        break;
                    }
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(serde_json::to_value(CreateResult {
            context: result.target_id,
        })
        .unwrap_or_default())
    }

    pub async fn context_navigate(&self, params: NavigateParams) -> CommandResult {
        let target = self
            .contexts
            .target_of(&params.context)
            .await
            .ok_or_else(|| CommandError::no_such_frame(&params.context))?;
        let epoch_before = self
            .contexts
            .navigation_progress(&params.context)
            .await
            .map(|(epoch, _, _)| epoch)
            .unwrap_or(0);

        let result: PageNavigateResult = target
            .client()
            .send_command(
                "Page.navigate",
                &PageNavigate {
                    url: params.url.clone(),
                },
            )
            .await
            .map_err(CommandError::from)?;
        if let Some(error_text) = result.error_text {
            return Err(CommandError::new(
                crate::error::ErrorCode::UnknownError,
                error_text,
            ));
        }

        let navigation = result.loader_id;
        let wait = params.wait.unwrap_or(ReadinessState::None);
        if wait == ReadinessState::None || navigation.is_none() {
            return Ok(serde_json::to_value(NavigateResult {
                navigation,
                url: params.url,
            })
            .unwrap_or_default());
        }

        let loader = navigation.clone().unwrap();
        loop {
            let Some((epoch, state, current_nav)) =
                self.contexts.navigation_progress(&params.context).await
            else {
                return Err(CommandError::no_such_frame(&params.context));
            };
            // Until the epoch moves, the stored state still describes the
            // previous document
            if epoch > epoch_before {
                match current_nav {
                    Some(nav) if nav == loader => {
                        if state >= wait {
                            break;
                        }
                    }
                    // Another navigation superseded this one; stop waiting
                    _ => break,
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let url = self
            .contexts
            .info_of(&params.context)
            .await
            .map(|info| info.url)
            .unwrap_or(params.url);
        Ok(serde_json::to_value(NavigateResult { navigation, url }).unwrap_or_default())
    }

    pub async fn context_close(&self, params: CloseParams) -> CommandResult {
        if !self.contexts.exists(&params.context).await {
            return Err(CommandError::no_such_frame(&params.context));
        }
        if !self.contexts.is_top_level(&params.context).await {
            return Err(CommandError::invalid_argument(
                "Only top-level contexts can be closed",
            ));
        }
        self.browser_client
            .send_command::<_, Value>(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: params.context.clone(),
                },
            )
            .await
            .map_err(CommandError::from)?;

        // Bounded wait for the detach, then proceed regardless
        let deadline = tokio::time::Instant::now() + CLOSE_DETACH_TIMEOUT;
        while self.contexts.exists(&params.context).await {
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!("Close of {} saw no detach in time", params.context);
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(json!({}))
    }

    pub async fn context_get_tree(&self, params: GetTreeParams) -> CommandResult {
        if let Some(root) = &params.root {
            if !self.contexts.exists(root).await {
                return Err(CommandError::no_such_frame(root));
            }
        }
        let contexts = self
            .contexts
            .get_tree(params.root.as_deref(), params.max_depth)
            .await;
        Ok(serde_json::to_value(GetTreeResult { contexts }).unwrap_or_default())
    }

    pub async fn context_set_viewport(
        &self,
        params: SetViewportParams,
    ) -> CommandResult {
        if !self.contexts.exists(&params.context).await {
            return Err(CommandError::no_such_frame(&params.context));
        }
        if !self.contexts.is_top_level(&params.context).await {
            return Err(CommandError::invalid_argument(
                "setViewport is only supported on top-level contexts",
            ));
        }
        let target = self
            .contexts
            .target_of(&params.context)
            .await
            .ok_or_else(|| CommandError::no_such_frame(&params.context))?;

        match params.viewport {
            Some(viewport) => {
                target
                    .client()
                    .send_command::<_, Value>(
                        "Emulation.setDeviceMetricsOverride",
                        &EmulationSetDeviceMetricsOverride {
                            width: viewport.width,
                            height: viewport.height,
                            device_scale_factor: params.device_pixel_ratio.unwrap_or(0.0),
                            mobile: false,
                        },
                    )
                    .await
            }
            None => {
                target
                    .client()
                    .send_command::<_, Value>(
                        "Emulation.clearDeviceMetricsOverride",
                        &EmulationClearDeviceMetricsOverride {},
                    )
                    .await
            }
        }
        .map_err(CommandError::from)?;
        Ok(json!({}))
    }

    pub async fn context_handle_user_prompt(
        &self,
        params: HandleUserPromptParams,
    ) -> CommandResult {
        let target = self
            .contexts
            .target_of(&params.context)
            .await
            .ok_or_else(|| CommandError::no_such_frame(&params.context))?;
        target
            .client()
            .send_command::<_, Value>(
                "Page.handleJavaScriptDialog",
                &PageHandleJavaScriptDialog {
                    accept: params.accept.unwrap_or(true),
                    prompt_text: params.user_text,
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(json!({}))
    }

    // =====================================================================
    // network.*
    // =====================================================================

    pub async fn network_add_intercept(
        &self,
        params: AddInterceptParams,
    ) -> CommandResult {
        if let Some(contexts) = &params.contexts {
            for context in contexts {
                if !self.contexts.exists(context).await {
                    return Err(CommandError::no_such_frame(context));
                }
                if !self.contexts.is_top_level(context).await {
                    return Err(CommandError::invalid_argument(format!(
                        "Context '{context}' is not top-level"
                    )));
                }
            }
        }
        let intercept = self.network.add_intercept(&params).await?;
        self.sync_targets_network().await;
        Ok(serde_json::to_value(AddInterceptResult { intercept }).unwrap_or_default())
    }

    pub async fn network_remove_intercept(
        &self,
        params: RemoveInterceptParams,
    ) -> CommandResult {
        self.network.remove_intercept(&params.intercept).await?;
        self.sync_targets_network().await;
        Ok(json!({}))
    }

    pub async fn network_continue_request(
        &self,
        params: ContinueRequestParams,
    ) -> CommandResult {
        self.network.continue_request(&params).await?;
        Ok(json!({}))
    }

    pub async fn network_fail_request(
        &self,
        params: FailRequestParams,
    ) -> CommandResult {
        self.network.fail_request(&params).await?;
        Ok(json!({}))
    }

    pub async fn network_provide_response(
        &self,
        params: ProvideResponseParams,
    ) -> CommandResult {
        self.network.provide_response(&params).await?;
        Ok(json!({}))
    }

    pub async fn network_continue_response(
        &self,
        params: ContinueResponseParams,
    ) -> CommandResult {
        self.network.continue_response(&params).await?;
        Ok(json!({}))
    }

    pub async fn network_continue_with_auth(
        &self,
        params: ContinueWithAuthParams,
    ) -> CommandResult {
        self.network.continue_with_auth(&params).await?;
        Ok(json!({}))
    }

    // =====================================================================
    // script.*
    // =====================================================================

    pub async fn script_add_preload(
        &self,
        params: AddPreloadScriptParams,
    ) -> CommandResult {
        if let Some(contexts) = &params.contexts {
            for context in contexts {
                if !self.contexts.exists(context).await {
                    return Err(CommandError::no_such_frame(context));
                }
                if !self.contexts.is_top_level(context).await {
                    return Err(CommandError::invalid_argument(format!(
                        "Context '{context}' is not top-level"
                    )));
                }
            }
        }
        let channels: Vec<String> = params
            .arguments
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|ChannelValue::Channel { value }| value.channel.clone())
            .collect();
        let script = PreloadScript::new(
            &params.function_declaration,
            params.sandbox,
            channels,
            params.contexts,
        );
        let script_id = script.id.clone();
        let source = script.source.clone();
        let sandbox = script.sandbox.clone();
        let scoped = script.contexts.clone();
        self.preload.insert(script).await;

        // Install on every live matching target; new targets get it during
        // unblock
        for target in self.contexts.all_targets().await {
            let top_level = self
                .contexts
                .top_level_id(target.target_id())
                .await
                .unwrap_or_else(|| target.target_id().to_string());
            let matches = match &scoped {
                None => true,
                Some(contexts) => contexts.iter().any(|c| c == &top_level),
            };
            if !matches {
                continue;
            }
            match target.install_script(&source, sandbox.as_deref()).await {
                Ok(cdp_id) => {
                    self.preload
                        .record_cdp_id(&script_id, target.target_id(), cdp_id)
                        .await;
                }
                Err(err) if err.is_close() => {}
                Err(err) => {
                    tracing::warn!(
                        "Preload install on {} failed: {}",
                        target.target_id(),
                        err
                    );
                }
            }
        }

        Ok(serde_json::to_value(AddPreloadScriptResult { script: script_id })
            .unwrap_or_default())
    }

    pub async fn script_remove_preload(
        &self,
        params: RemovePreloadScriptParams,
    ) -> CommandResult {
        let script = self
            .preload
            .remove(&params.script)
            .await
            .ok_or_else(|| CommandError::no_such_script(&params.script))?;
        for (target_id, cdp_id) in &script.cdp_ids {
            let Some(target) = self.contexts.target_of(target_id).await else {
                continue;
            };
            let result = target
                .client()
                .send_command::<_, Value>(
                    "Page.removeScriptToEvaluateOnNewDocument",
                    &PageRemoveScriptToEvaluateOnNewDocument {
                        identifier: cdp_id.clone(),
                    },
                )
                .await;
            if let Err(err) = result {
                if !err.is_close() {
                    tracing::warn!("Preload removal on {} failed: {}", target_id, err);
                }
            }
        }
        Ok(json!({}))
    }

    // =====================================================================
    // cdp.* passthrough
    // =====================================================================

    pub async fn cdp_send_command(
        &self,
        params: CdpSendCommandParams,
    ) -> CommandResult {
        let client = self.client_for(params.session.as_deref());
        let result = client
            .send_command_raw(&params.method, params.params)
            .await
            .map_err(CommandError::from)?;
        Ok(serde_json::to_value(CdpSendCommandResult {
            result,
            session: params.session,
        })
        .unwrap_or_default())
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
