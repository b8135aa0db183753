//! Network interception engine
//!
//! The storage owns two tables: the intercept registry (BiDi intercepts,
//! each a set of URL patterns times a set of phases) and the in-flight
//! request table. CDP Network/Fetch events drive the per-request lifecycle;
//! BiDi network commands resolve paused requests through the Fetch domain.

pub mod pattern;
pub mod request;

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cdp::types::{
    AuthRequiredEvent as CdpAuthRequiredEvent, FetchContinueRequest, FetchContinueResponse,
    FetchContinueWithAuth, FetchFailRequest, FetchFulfillRequest, FetchHeaderEntry,
    LoadingFailedEvent, LoadingFinishedEvent, RequestPausedEvent, RequestServedFromCacheEvent,
    RequestWillBeSentEvent, RequestWillBeSentExtraInfoEvent, ResponseReceivedEvent,
    ResponseReceivedExtraInfoEvent,
};
use crate::cdp::types::AuthChallengeResponse;
use crate::cdp::CdpClient;
use crate::context::BrowsingContextStorage;
use crate::error::CommandError;
use crate::event::EventManager;
use crate::protocol::{
    AddInterceptParams, AuthRequiredEvent, BeforeRequestSentEvent, BytesValue,
    ContinueRequestParams, ContinueResponseParams, ContinueWithAuthAction,
    ContinueWithAuthParams, FailRequestParams, FetchErrorEvent, Header, InterceptPhase,
    ProvideResponseParams, ResponseCompletedEvent, ResponseData, ResponseStartedEvent,
};

pub use pattern::UrlPattern;
pub use request::NetworkRequest;

/// Which Fetch stages a target must intercept at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStages {
    pub request: bool,
    pub response: bool,
    pub auth: bool,
}

impl FetchStages {
    pub fn is_active(&self) -> bool {
        self.request || self.response || self.auth
    }
}

/// A registered intercept
pub struct Intercept {
    pub id: String,
    /// Empty = match every URL
    pub patterns: Vec<UrlPattern>,
    pub phases: Vec<InterceptPhase>,
    /// Top-level context ids; None = every target
    pub contexts: Option<Vec<String>>,
}

impl Intercept {
    fn matches_url(&self, url: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches_str(url))
    }

    fn scoped_to(&self, top_level: Option<&str>) -> bool {
        match (&self.contexts, top_level) {
            (None, _) => true,
            (Some(contexts), Some(top)) => contexts.iter().any(|c| c == top),
            (Some(_), None) => false,
        }
    }
}

struct Inner {
    intercepts: HashMap<String, Intercept>,
    requests: HashMap<String, NetworkRequest>,
    /// Extra-info arriving before the primary event is parked here
    pending_request_extra: HashMap<String, HashMap<String, String>>,
    pending_response_extra: HashMap<String, HashMap<String, String>>,
}

/// An event to hand to the EventManager once the storage lock is released
type Emission = (&'static str, Option<String>, Value);

/// In-flight request table plus the intercept registry
#[derive(Clone)]
pub struct NetworkStorage {
    inner: Arc<Mutex<Inner>>,
    events: EventManager,
    contexts: BrowsingContextStorage,
}

impl NetworkStorage {
    pub fn new(events: EventManager, contexts: BrowsingContextStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                intercepts: HashMap::new(),
                requests: HashMap::new(),
                pending_request_extra: HashMap::new(),
                pending_response_extra: HashMap::new(),
            })),
            events,
            contexts,
        }
    }

    // =====================================================================
    // Intercept registry
    // =====================================================================

    /// Validate and register an intercept; the caller synchronises targets
    pub async fn add_intercept(&self, params: &AddInterceptParams) -> Result<String, CommandError> {
        if params.phases.is_empty() {
            return Err(CommandError::invalid_argument("phases must not be empty"));
        }
        let mut patterns = Vec::new();
        for spec in params.url_patterns.as_deref().unwrap_or(&[]) {
            patterns.push(UrlPattern::parse(spec)?);
        }
        let id = Uuid::new_v4().to_string();
        self.inner.lock().await.intercepts.insert(
            id.clone(),
            Intercept {
                id: id.clone(),
                patterns,
                phases: params.phases.clone(),
                contexts: params.contexts.clone(),
            },
        );
        Ok(id)
    }

    pub async fn remove_intercept(&self, id: &str) -> Result<(), CommandError> {
        if self.inner.lock().await.intercepts.remove(id).is_none() {
            return Err(CommandError::no_such_intercept(id));
        }
        Ok(())
    }

    /// OR together the phases of every intercept scoped to a target subtree
    pub async fn interception_stages(&self, top_level: &str) -> FetchStages {
        let inner = self.inner.lock().await;
        let mut stages = FetchStages::default();
        for intercept in inner.intercepts.values() {
            if !intercept.scoped_to(Some(top_level)) {
                continue;
            }
            for phase in &intercept.phases {
                match phase {
                    InterceptPhase::BeforeRequestSent => stages.request = true,
                    InterceptPhase::ResponseStarted => stages.response = true,
                    InterceptPhase::AuthRequired => stages.auth = true,
                }
            }
        }
        stages
    }

    /// Whether any request of the session is still parked; gates the
    /// deferred Fetch.disable
    pub async fn has_paused_for_session(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .requests
            .values()
            .any(|r| r.is_paused() && r.client.session_id() == Some(session_id))
    }

    fn blocked_intercepts(
        intercepts: &HashMap<String, Intercept>,
        url: &str,
        phase: InterceptPhase,
        top_level: Option<&str>,
    ) -> Vec<String> {
        let mut ids: Vec<String> = intercepts
            .values()
            .filter(|i| i.phases.contains(&phase) && i.scoped_to(top_level) && i.matches_url(url))
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn top_level_of(&self, context: Option<&str>) -> Option<String> {
        match context {
            Some(id) => self.contexts.top_level_id(id).await,
            None => None,
        }
    }

    // =====================================================================
    // CDP event handlers
    // =====================================================================

    pub async fn on_request_will_be_sent(&self, client: CdpClient, ev: RequestWillBeSentEvent) {
        let top_level = self.top_level_of(ev.frame_id.as_deref()).await;
        let mut emissions: Vec<Emission> = Vec::new();
        {
            let mut inner = self.inner.lock().await;

            let existing = inner.requests.contains_key(&ev.request_id);
            if existing {
                if let Some(redirect_response) = &ev.redirect_response {
                    // Close out the previous attempt before re-keying
                    let request = inner.requests.get_mut(&ev.request_id).unwrap();
                    let started = ResponseStartedEvent {
                        context: request.context.clone(),
                        is_blocked: false,
                        intercepts: None,
                        redirect_count: request.redirect_count,
                        request: request.request_data(),
                        response: request.response_data_from(redirect_response),
                    };
                    emissions.push((
                        "network.responseStarted",
                        request.context.clone(),
                        serde_json::to_value(started).unwrap_or_default(),
                    ));
                    request.begin_redirect(&ev.request);
                }
            } else {
                let mut request = NetworkRequest::new(
                    ev.request_id.clone(),
                    client,
                    ev.frame_id.clone(),
                    &ev.request,
                );
                if let Some(extra) = inner.pending_request_extra.remove(&ev.request_id) {
                    request.merge_request_extra_info(extra);
                }
                if let Some(extra) = inner.pending_response_extra.remove(&ev.request_id) {
                    request.merge_response_extra_info(extra);
                }
                inner.requests.insert(ev.request_id.clone(), request);
            }

            let blocked = Self::blocked_intercepts(
                &inner.intercepts,
                &ev.request.url,
                InterceptPhase::BeforeRequestSent,
                top_level.as_deref(),
            );
            let request = inner.requests.get_mut(&ev.request_id).unwrap();
            if !request.before_request_sent_emitted {
                request.before_request_sent_emitted = true;
                let is_blocked = !blocked.is_empty();
                if is_blocked {
                    request.park(InterceptPhase::BeforeRequestSent, blocked.clone());
                }
                let event = BeforeRequestSentEvent {
                    context: request.context.clone(),
                    is_blocked,
                    intercepts: if is_blocked { Some(blocked) } else { None },
                    redirect_count: request.redirect_count,
                    request: request.request_data(),
                };
                emissions.push((
                    "network.beforeRequestSent",
                    request.context.clone(),
                    serde_json::to_value(event).unwrap_or_default(),
                ));
            }
        }
        self.emit(emissions).await;
    }

    pub async fn on_request_paused(&self, client: CdpClient, ev: RequestPausedEvent) {
        let response_stage = ev.response_status_code.is_some() || ev.response_error_reason.is_some();
        let phase = if response_stage {
            InterceptPhase::ResponseStarted
        } else {
            InterceptPhase::BeforeRequestSent
        };
        let id = ev.network_id.clone().unwrap_or_else(|| ev.request_id.clone());
        let top_level = self.top_level_of(ev.frame_id.as_deref()).await;

        let mut emissions: Vec<Emission> = Vec::new();
        let mut auto_continue: Option<(CdpClient, String, bool)> = None;
        {
            let mut inner = self.inner.lock().await;
            let blocked =
                Self::blocked_intercepts(&inner.intercepts, &ev.request.url, phase, top_level.as_deref());

            let request = inner.requests.entry(id.clone()).or_insert_with(|| {
                NetworkRequest::new(id.clone(), client, ev.frame_id.clone(), &ev.request)
            });
            request.fetch_id = Some(ev.request_id.clone());

            if blocked.is_empty() || request.served_from_cache {
                // Every request pauses once Fetch is on; unmatched ones are
                // let through without surfacing anything to the client
                auto_continue = Some((
                    request.client.clone(),
                    ev.request_id.clone(),
                    response_stage,
                ));
                request.fetch_id = None;
            } else {
                request.park(phase, blocked.clone());
                if response_stage && !request.response_started_emitted {
                    request.response_started_emitted = true;
                    let response = ResponseData {
                        url: request.url.clone(),
                        status: ev.response_status_code.unwrap_or(0),
                        status_text: String::new(),
                        headers: ev
                            .response_headers
                            .as_deref()
                            .unwrap_or(&[])
                            .iter()
                            .map(|h| Header::string(h.name.clone(), h.value.clone()))
                            .collect(),
                        mime_type: None,
                        from_cache: false,
                    };
                    let event = ResponseStartedEvent {
                        context: request.context.clone(),
                        is_blocked: true,
                        intercepts: Some(blocked),
                        redirect_count: request.redirect_count,
                        request: request.request_data(),
                        response,
                    };
                    emissions.push((
                        "network.responseStarted",
                        request.context.clone(),
                        serde_json::to_value(event).unwrap_or_default(),
                    ));
                }
            }
        }
        self.emit(emissions).await;

        if let Some((client, fetch_id, response_stage)) = auto_continue {
            let result = if response_stage {
                client
                    .send_command::<_, Value>(
                        "Fetch.continueResponse",
                        &FetchContinueResponse {
                            request_id: fetch_id,
                            response_code: None,
                            response_phrase: None,
                            response_headers: None,
                        },
                    )
                    .await
            } else {
                client
                    .send_command::<_, Value>(
                        "Fetch.continueRequest",
                        &FetchContinueRequest {
                            request_id: fetch_id,
                            url: None,
                            method: None,
                            headers: None,
                        },
                    )
                    .await
            };
            if let Err(err) = result {
                if !err.is_close() {
                    tracing::warn!("Auto-continue failed: {}", err);
                }
            }
        }
    }

    pub async fn on_response_received(&self, client: CdpClient, ev: ResponseReceivedEvent) {
        let top_level = self.top_level_of(ev.frame_id.as_deref()).await;
        let mut emissions: Vec<Emission> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let blocked = Self::blocked_intercepts(
                &inner.intercepts,
                &ev.response.url,
                InterceptPhase::ResponseStarted,
                top_level.as_deref(),
            );
            let request = inner.requests.entry(ev.request_id.clone()).or_insert_with(|| {
                NetworkRequest::new(
                    ev.request_id.clone(),
                    client,
                    ev.frame_id.clone(),
                    &crate::cdp::types::CdpRequest {
                        url: ev.response.url.clone(),
                        method: String::new(),
                        headers: HashMap::new(),
                    },
                )
            });
            request.set_response(ev.response.clone());

            if !request.response_started_emitted {
                request.response_started_emitted = true;
                let is_blocked = !blocked.is_empty();
                if is_blocked {
                    request.park(InterceptPhase::ResponseStarted, blocked.clone());
                }
                let event = ResponseStartedEvent {
                    context: request.context.clone(),
                    is_blocked,
                    intercepts: if is_blocked { Some(blocked) } else { None },
                    redirect_count: request.redirect_count,
                    request: request.request_data(),
                    response: request.response_data().unwrap(),
                };
                emissions.push((
                    "network.responseStarted",
                    request.context.clone(),
                    serde_json::to_value(event).unwrap_or_default(),
                ));
            }
        }
        self.emit(emissions).await;
    }

    pub async fn on_auth_required(&self, client: CdpClient, ev: CdpAuthRequiredEvent) {
        let id = ev.network_id.clone().unwrap_or_else(|| ev.request_id.clone());
        let top_level = self.top_level_of(ev.frame_id.as_deref()).await;

        let mut emissions: Vec<Emission> = Vec::new();
        let mut default_continue: Option<(CdpClient, String)> = None;
        {
            let mut inner = self.inner.lock().await;
            let blocked = Self::blocked_intercepts(
                &inner.intercepts,
                &ev.request.url,
                InterceptPhase::AuthRequired,
                top_level.as_deref(),
            );
            let request = inner.requests.entry(id.clone()).or_insert_with(|| {
                NetworkRequest::new(id.clone(), client, ev.frame_id.clone(), &ev.request)
            });
            request.fetch_id = Some(ev.request_id.clone());

            if blocked.is_empty() {
                // Nobody listening: let the browser's own credential flow run
                default_continue = Some((request.client.clone(), ev.request_id.clone()));
                request.fetch_id = None;
            } else {
                request.park(InterceptPhase::AuthRequired, blocked.clone());
                let event = AuthRequiredEvent {
                    context: request.context.clone(),
                    is_blocked: true,
                    intercepts: Some(blocked),
                    request: request.request_data(),
                    response: ResponseData {
                        url: request.url.clone(),
                        status: 401,
                        status_text: "Unauthorized".into(),
                        headers: Vec::new(),
                        mime_type: None,
                        from_cache: false,
                    },
                };
                emissions.push((
                    "network.authRequired",
                    request.context.clone(),
                    serde_json::to_value(event).unwrap_or_default(),
                ));
            }
        }
        self.emit(emissions).await;

        if let Some((client, fetch_id)) = default_continue {
            let result = client
                .send_command::<_, Value>(
                    "Fetch.continueWithAuth",
                    &FetchContinueWithAuth {
                        request_id: fetch_id,
                        auth_challenge_response: AuthChallengeResponse {
                            response: "Default",
                            username: None,
                            password: None,
                        },
                    },
                )
                .await;
            if let Err(err) = result {
                if !err.is_close() {
                    tracing::warn!("Default auth continue failed: {}", err);
                }
            }
        }
    }

    pub async fn on_request_extra_info(&self, ev: RequestWillBeSentExtraInfoEvent) {
        let mut inner = self.inner.lock().await;
        match inner.requests.get_mut(&ev.request_id) {
            Some(request) => request.merge_request_extra_info(ev.headers),
            None => {
                inner.pending_request_extra.insert(ev.request_id, ev.headers);
            }
        }
    }

    pub async fn on_response_extra_info(&self, ev: ResponseReceivedExtraInfoEvent) {
        let mut inner = self.inner.lock().await;
        match inner.requests.get_mut(&ev.request_id) {
            Some(request) => request.merge_response_extra_info(ev.headers),
            None => {
                inner
                    .pending_response_extra
                    .insert(ev.request_id, ev.headers);
            }
        }
    }

    pub async fn on_served_from_cache(&self, ev: RequestServedFromCacheEvent) {
        if let Some(request) = self.inner.lock().await.requests.get_mut(&ev.request_id) {
            request.served_from_cache = true;
        }
    }

    /// Terminal: the request completed. Returns the session the request
    /// lived on so the owning target can re-check a deferred Fetch.disable.
    pub async fn on_loading_finished(&self, ev: LoadingFinishedEvent) -> Option<String> {
        let mut emissions: Vec<Emission> = Vec::new();
        let session;
        {
            let mut inner = self.inner.lock().await;
            let request = inner.requests.remove(&ev.request_id)?;
            session = request.client.session_id().map(String::from);
            let event = ResponseCompletedEvent {
                context: request.context.clone(),
                redirect_count: request.redirect_count,
                request: request.request_data(),
                response: request.response_data(),
            };
            emissions.push((
                "network.responseCompleted",
                request.context.clone(),
                serde_json::to_value(event).unwrap_or_default(),
            ));
        }
        self.emit(emissions).await;
        session
    }

    /// Terminal: the request failed
    pub async fn on_loading_failed(&self, ev: LoadingFailedEvent) -> Option<String> {
        let mut emissions: Vec<Emission> = Vec::new();
        let session;
        {
            let mut inner = self.inner.lock().await;
            let request = inner.requests.remove(&ev.request_id)?;
            session = request.client.session_id().map(String::from);
            let event = FetchErrorEvent {
                context: request.context.clone(),
                redirect_count: request.redirect_count,
                request: request.request_data(),
                error_text: ev.error_text.clone(),
            };
            emissions.push((
                "network.fetchError",
                request.context.clone(),
                serde_json::to_value(event).unwrap_or_default(),
            ));
        }
        self.emit(emissions).await;
        session
    }

    /// Drop every request of a detached session. Paused requests get their
    /// one terminal event; callers must run this while the session's
    /// contexts are still in storage.
    pub async fn dispose_session(&self, session_id: &str) {
        let mut emissions: Vec<Emission> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner
                .requests
                .values()
                .filter(|r| r.client.session_id() == Some(session_id))
                .map(|r| r.id.clone())
                .collect();
            for id in ids {
                let request = inner.requests.remove(&id).unwrap();
                if request.is_paused() {
                    let event = FetchErrorEvent {
                        context: request.context.clone(),
                        redirect_count: request.redirect_count,
                        request: request.request_data(),
                        error_text: "Request was destroyed".into(),
                    };
                    emissions.push((
                        "network.fetchError",
                        request.context.clone(),
                        serde_json::to_value(event).unwrap_or_default(),
                    ));
                }
            }
        }
        self.emit(emissions).await;
    }

    // =====================================================================
    // BiDi command resolution
    // =====================================================================

    pub async fn continue_request(&self, params: &ContinueRequestParams) -> Result<(), CommandError> {
        let (client, fetch_id) = self
            .take_paused(&params.request, &[InterceptPhase::BeforeRequestSent])
            .await?;
        client
            .send_command::<_, Value>(
                "Fetch.continueRequest",
                &FetchContinueRequest {
                    request_id: fetch_id,
                    url: params.url.clone(),
                    method: params.method.clone(),
                    headers: params.headers.as_deref().map(fetch_headers),
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }

    pub async fn fail_request(&self, params: &FailRequestParams) -> Result<(), CommandError> {
        let (client, fetch_id) = self
            .take_paused(
                &params.request,
                &[
                    InterceptPhase::BeforeRequestSent,
                    InterceptPhase::ResponseStarted,
                ],
            )
            .await?;
        client
            .send_command::<_, Value>(
                "Fetch.failRequest",
                &FetchFailRequest {
                    request_id: fetch_id,
                    error_reason: "Failed".into(),
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }

    pub async fn provide_response(&self, params: &ProvideResponseParams) -> Result<(), CommandError> {
        let (client, fetch_id) = self
            .take_paused(
                &params.request,
                &[
                    InterceptPhase::BeforeRequestSent,
                    InterceptPhase::ResponseStarted,
                    InterceptPhase::AuthRequired,
                ],
            )
            .await?;
        let body = match &params.body {
            Some(BytesValue::String { value }) => {
                Some(base64::engine::general_purpose::STANDARD.encode(value))
            }
            Some(BytesValue::Base64 { value }) => Some(value.clone()),
            None => None,
        };
        client
            .send_command::<_, Value>(
                "Fetch.fulfillRequest",
                &FetchFulfillRequest {
                    request_id: fetch_id,
                    response_code: params.status_code.unwrap_or(200),
                    response_phrase: params.reason_phrase.clone(),
                    response_headers: params.headers.as_deref().map(fetch_headers),
                    body,
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }

    pub async fn continue_response(
        &self,
        params: &ContinueResponseParams,
    ) -> Result<(), CommandError> {
        let (client, fetch_id) = self
            .take_paused(&params.request, &[InterceptPhase::ResponseStarted])
            .await?;
        client
            .send_command::<_, Value>(
                "Fetch.continueResponse",
                &FetchContinueResponse {
                    request_id: fetch_id,
                    response_code: params.status_code,
                    response_phrase: params.reason_phrase.clone(),
                    response_headers: params.headers.as_deref().map(fetch_headers),
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }

    pub async fn continue_with_auth(
        &self,
        params: &ContinueWithAuthParams,
    ) -> Result<(), CommandError> {
        let response = match params.action {
            ContinueWithAuthAction::Default => AuthChallengeResponse {
                response: "Default",
                username: None,
                password: None,
            },
            ContinueWithAuthAction::Cancel => AuthChallengeResponse {
                response: "CancelAuth",
                username: None,
                password: None,
            },
            ContinueWithAuthAction::ProvideCredentials => {
                let credentials = params.credentials.as_ref().ok_or_else(|| {
                    CommandError::invalid_argument(
                        "provideCredentials requires credentials",
                    )
                })?;
                AuthChallengeResponse {
                    response: "ProvideCredentials",
                    username: Some(credentials.username.clone()),
                    password: Some(credentials.password.clone()),
                }
            }
        };
        let (client, fetch_id) = self
            .take_paused(&params.request, &[InterceptPhase::AuthRequired])
            .await?;
        client
            .send_command::<_, Value>(
                "Fetch.continueWithAuth",
                &FetchContinueWithAuth {
                    request_id: fetch_id,
                    auth_challenge_response: response,
                },
            )
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }

    /// Release a parked request, handing back its client and fetch id. The
    /// request must be parked in one of the allowed phases.
    async fn take_paused(
        &self,
        request_id: &str,
        allowed: &[InterceptPhase],
    ) -> Result<(CdpClient, String), CommandError> {
        let mut inner = self.inner.lock().await;
        let request = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| CommandError::no_such_request(request_id))?;
        let phase = request
            .phase
            .ok_or_else(|| CommandError::no_such_request(request_id))?;
        if !allowed.contains(&phase) {
            return Err(CommandError::invalid_argument(format!(
                "Request '{request_id}' is not paused in a compatible phase"
            )));
        }
        let fetch_id = request.fetch_id.clone().ok_or_else(|| {
            CommandError::invalid_argument(format!(
                "Request '{request_id}' has no pending fetch pause"
            ))
        })?;
        let client = request.client.clone();
        request.release();
        Ok((client, fetch_id))
    }

    async fn emit(&self, emissions: Vec<Emission>) {
        for (method, context, params) in emissions {
            self.events
                .register_event(method, context.as_deref(), params)
                .await;
        }
    }
}

fn fetch_headers(headers: &[Header]) -> Vec<FetchHeaderEntry> {
    headers
        .iter()
        .map(|h| FetchHeaderEntry {
            name: h.name.clone(),
            value: match &h.value {
                BytesValue::String { value } => value.clone(),
                BytesValue::Base64 { value } => base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UrlPatternSpec;
    use crate::testutil::FakeCdp;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn setup() -> (NetworkStorage, mpsc::Receiver<String>, FakeCdp) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let contexts = BrowsingContextStorage::new();
        let events = EventManager::new(outbound_tx, contexts.clone());
        events.subscribe(vec!["network".into()], None).await;
        let storage = NetworkStorage::new(events, contexts);
        let (fake, _cdp_events) = FakeCdp::new();
        (storage, outbound_rx, fake)
    }

    fn will_be_sent(id: &str, url: &str) -> RequestWillBeSentEvent {
        serde_json::from_value(json!({
            "requestId": id,
            "loaderId": "l1",
            "request": {"url": url, "method": "GET", "headers": {}},
        }))
        .unwrap()
    }

    fn match_all_params(phases: Vec<InterceptPhase>) -> AddInterceptParams {
        AddInterceptParams {
            phases,
            url_patterns: None,
            contexts: None,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn intercept_add_remove_exactly_once() {
        let (storage, _rx, _fake) = setup().await;
        let id = storage
            .add_intercept(&match_all_params(vec![InterceptPhase::BeforeRequestSent]))
            .await
            .unwrap();
        assert!(storage.remove_intercept(&id).await.is_ok());
        let err = storage.remove_intercept(&id).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NoSuchIntercept);
    }

    #[tokio::test]
    async fn empty_phases_rejected() {
        let (storage, _rx, _fake) = setup().await;
        let err = storage.add_intercept(&match_all_params(vec![])).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn stages_or_across_intercepts() {
        let (storage, _rx, _fake) = setup().await;
        storage
            .add_intercept(&match_all_params(vec![InterceptPhase::BeforeRequestSent]))
            .await
            .unwrap();
        storage
            .add_intercept(&match_all_params(vec![InterceptPhase::AuthRequired]))
            .await
            .unwrap();
        let stages = storage.interception_stages("top").await;
        assert!(stages.request);
        assert!(!stages.response);
        assert!(stages.auth);
    }

    #[tokio::test]
    async fn unmatched_request_is_not_blocked() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .add_intercept(&AddInterceptParams {
                phases: vec![InterceptPhase::BeforeRequestSent],
                url_patterns: Some(vec![UrlPatternSpec::String {
                    pattern: "http://match.example/".into(),
                }]),
                contexts: None,
            })
            .await
            .unwrap();

        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://other.example/"),
            )
            .await;
        let event = next_event(&mut rx).await;
        assert_eq!(event["method"], "network.beforeRequestSent");
        assert_eq!(event["params"]["isBlocked"], false);
        assert!(event["params"].get("intercepts").is_none());
    }

    #[tokio::test]
    async fn matched_request_is_blocked_and_paused() {
        let (storage, mut rx, fake) = setup().await;
        let intercept = storage
            .add_intercept(&match_all_params(vec![InterceptPhase::BeforeRequestSent]))
            .await
            .unwrap();

        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://example.com/"),
            )
            .await;
        let event = next_event(&mut rx).await;
        assert_eq!(event["params"]["isBlocked"], true);
        assert_eq!(event["params"]["intercepts"][0], json!(intercept));

        // Fetch pause delivers the fetch id
        storage
            .on_request_paused(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "f1",
                    "request": {"url": "http://example.com/", "method": "GET", "headers": {}},
                    "networkId": "r1",
                }))
                .unwrap(),
            )
            .await;
        assert!(storage.has_paused_for_session("s1").await);

        // continueRequest resolves through Fetch with the fetch id
        storage
            .continue_request(&ContinueRequestParams {
                request: "r1".into(),
                url: None,
                method: None,
                headers: None,
            })
            .await
            .unwrap();
        let sent = fake.commands_named("Fetch.continueRequest").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["params"]["requestId"], "f1");
        assert!(!storage.has_paused_for_session("s1").await);
    }

    #[tokio::test]
    async fn unmatched_pause_is_auto_continued() {
        let (storage, _rx, fake) = setup().await;
        storage
            .on_request_paused(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "f9",
                    "request": {"url": "http://example.com/", "method": "GET", "headers": {}},
                    "networkId": "r9",
                }))
                .unwrap(),
            )
            .await;
        let sent = fake.commands_named("Fetch.continueRequest").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["params"]["requestId"], "f9");
        assert!(!storage.has_paused_for_session("s1").await);
    }

    #[tokio::test]
    async fn auth_without_listener_continues_with_default() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .on_auth_required(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "f2",
                    "request": {"url": "http://example.com/", "method": "GET", "headers": {}},
                    "authChallenge": {"origin": "http://example.com", "scheme": "basic", "realm": "r"},
                    "networkId": "r2",
                }))
                .unwrap(),
            )
            .await;

        let sent = fake.commands_named("Fetch.continueWithAuth").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0]["params"]["authChallengeResponse"]["response"],
            "Default"
        );
        // And no BiDi event surfaced
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_with_listener_blocks_until_continue_with_auth() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .add_intercept(&match_all_params(vec![InterceptPhase::AuthRequired]))
            .await
            .unwrap();

        storage
            .on_auth_required(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "f3",
                    "request": {"url": "http://example.com/", "method": "GET", "headers": {}},
                    "authChallenge": {"origin": "http://example.com", "scheme": "basic", "realm": "r"},
                    "networkId": "r3",
                }))
                .unwrap(),
            )
            .await;
        let event = next_event(&mut rx).await;
        assert_eq!(event["method"], "network.authRequired");
        assert_eq!(event["params"]["isBlocked"], true);

        storage
            .continue_with_auth(&ContinueWithAuthParams {
                request: "r3".into(),
                action: ContinueWithAuthAction::ProvideCredentials,
                credentials: Some(crate::protocol::AuthCredentials {
                    username: "user".into(),
                    password: "hunter2".into(),
                }),
            })
            .await
            .unwrap();
        let sent = fake.commands_named("Fetch.continueWithAuth").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0]["params"]["authChallengeResponse"]["response"],
            "ProvideCredentials"
        );
        assert_eq!(sent[0]["params"]["authChallengeResponse"]["username"], "user");
    }

    #[tokio::test]
    async fn redirect_restarts_lifecycle_with_same_id() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .add_intercept(&match_all_params(vec![InterceptPhase::BeforeRequestSent]))
            .await
            .unwrap();

        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://example.com/a"),
            )
            .await;
        let first = next_event(&mut rx).await;
        assert_eq!(first["params"]["redirectCount"], 0);

        // 302 arrives as a new requestWillBeSent carrying redirectResponse
        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "r1",
                    "loaderId": "l1",
                    "request": {"url": "http://example.com/b", "method": "GET", "headers": {}},
                    "redirectResponse": {
                        "url": "http://example.com/a",
                        "status": 302,
                        "statusText": "Found",
                        "headers": {"Location": "http://example.com/b"}
                    },
                }))
                .unwrap(),
            )
            .await;

        let started = next_event(&mut rx).await;
        assert_eq!(started["method"], "network.responseStarted");
        assert_eq!(started["params"]["response"]["status"], 302);

        let second = next_event(&mut rx).await;
        assert_eq!(second["method"], "network.beforeRequestSent");
        assert_eq!(second["params"]["redirectCount"], 1);
        assert_eq!(second["params"]["request"]["request"], "r1");
        assert_eq!(second["params"]["request"]["url"], "http://example.com/b");
        assert_eq!(second["params"]["isBlocked"], true);
    }

    #[tokio::test]
    async fn loading_finished_emits_terminal_event() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://example.com/"),
            )
            .await;
        let _before = next_event(&mut rx).await;

        storage
            .on_response_received(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "r1",
                    "response": {"url": "http://example.com/", "status": 200, "statusText": "OK", "headers": {}},
                }))
                .unwrap(),
            )
            .await;
        let started = next_event(&mut rx).await;
        assert_eq!(started["method"], "network.responseStarted");
        assert_eq!(started["params"]["isBlocked"], false);

        let session = storage
            .on_loading_finished(serde_json::from_value(json!({"requestId": "r1"})).unwrap())
            .await;
        assert_eq!(session.as_deref(), Some("s1"));
        let completed = next_event(&mut rx).await;
        assert_eq!(completed["method"], "network.responseCompleted");
        assert_eq!(completed["params"]["response"]["status"], 200);

        // The entry is gone: a second terminal signal is a no-op
        assert!(storage
            .on_loading_finished(serde_json::from_value(json!({"requestId": "r1"})).unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn extra_info_tolerates_both_orders() {
        let (storage, mut rx, fake) = setup().await;

        // Extra-info first
        storage
            .on_request_extra_info(
                serde_json::from_value(json!({
                    "requestId": "r1",
                    "headers": {"Cookie": "a=1"},
                }))
                .unwrap(),
            )
            .await;
        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://example.com/"),
            )
            .await;
        let _before = next_event(&mut rx).await;

        storage
            .on_response_received(
                fake.connection.session_client("s1"),
                serde_json::from_value(json!({
                    "requestId": "r1",
                    "response": {"url": "http://example.com/", "status": 200, "statusText": "OK", "headers": {}},
                }))
                .unwrap(),
            )
            .await;
        let started = next_event(&mut rx).await;
        let request_headers = started["params"]["request"]["headers"].as_array().unwrap();
        assert!(request_headers.iter().any(|h| h["name"] == "Cookie"));
    }

    #[tokio::test]
    async fn session_disposal_settles_paused_requests() {
        let (storage, mut rx, fake) = setup().await;
        storage
            .add_intercept(&match_all_params(vec![InterceptPhase::BeforeRequestSent]))
            .await
            .unwrap();
        storage
            .on_request_will_be_sent(
                fake.connection.session_client("s1"),
                will_be_sent("r1", "http://example.com/"),
            )
            .await;
        let _before = next_event(&mut rx).await;

        storage.dispose_session("s1").await;
        let event = next_event(&mut rx).await;
        assert_eq!(event["method"], "network.fetchError");
        assert!(!storage.has_paused_for_session("s1").await);
    }

    #[tokio::test]
    async fn continue_request_on_unknown_id_fails() {
        let (storage, _rx, _fake) = setup().await;
        let err = storage
            .continue_request(&ContinueRequestParams {
                request: "nope".into(),
                url: None,
                method: None,
                headers: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NoSuchRequest);
    }
}
