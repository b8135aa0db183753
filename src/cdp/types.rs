//! Hand-written CDP types for the ~30 methods the mapper actually uses
//!
//! A minimal set instead of generated protocol bindings: command params,
//! command results, and the event payloads the processor consumes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// =========================================================================
// Target domain
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreateTarget {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_window: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreateTargetResult {
    #[serde(default)]
    pub target_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCloseTarget {
    pub target_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSetAutoAttach {
    pub auto_attach: bool,
    pub wait_for_debugger_on_start: bool,
    pub flatten: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSetDiscoverTargets {
    pub discover: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetachFromTarget {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    pub r#type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub browser_context_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetEvent {
    pub session_id: String,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetEvent {
    pub session_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
}

// =========================================================================
// Page domain
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct PageEnable {}

#[derive(Debug, Clone, Serialize)]
pub struct PageSetLifecycleEventsEnabled {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageNavigate {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageNavigateResult {
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: Option<String>,
    #[serde(default)]
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAddScriptToEvaluateOnNewDocument {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_immediately: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageAddScriptToEvaluateOnNewDocumentResult {
    #[serde(default)]
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRemoveScriptToEvaluateOnNewDocument {
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageHandleJavaScriptDialog {
    pub accept: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAttachedEvent {
    pub frame_id: String,
    pub parent_frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetachedEvent {
    pub frame_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameNavigatedEvent {
    pub frame: Frame,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavascriptDialogOpeningEvent {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub message: String,
    pub r#type: String,
    #[serde(default)]
    pub default_prompt: Option<String>,
}

// =========================================================================
// Runtime domain
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeEnable {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeRunIfWaitingForDebugger {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: u64,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aux_data: Option<ExecutionContextAuxData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextAuxData {
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionContextCreatedEvent {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyedEvent {
    pub execution_context_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalledEvent {
    pub r#type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(default)]
    pub execution_context_id: Option<u64>,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteObject {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

// =========================================================================
// Security / Emulation domains
// =========================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SecuritySetIgnoreCertificateErrors {
    pub ignore: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulationSetDeviceMetricsOverride {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmulationClearDeviceMetricsOverride {}

// =========================================================================
// Network domain
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEnable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_post_data_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkDisable {}

#[derive(Debug, Clone, Deserialize)]
pub struct CdpRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpResponse {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentEvent {
    pub request_id: String,
    #[serde(default)]
    pub loader_id: String,
    pub request: CdpRequest,
    #[serde(default)]
    pub redirect_response: Option<CdpResponse>,
    #[serde(default)]
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentExtraInfoEvent {
    pub request_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedEvent {
    pub request_id: String,
    pub response: CdpResponse,
    #[serde(default)]
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedExtraInfoEvent {
    pub request_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub status_code: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailedEvent {
    pub request_id: String,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinishedEvent {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestServedFromCacheEvent {
    pub request_id: String,
}

// =========================================================================
// Fetch domain
// =========================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequestPattern {
    pub url_pattern: String,
    pub request_stage: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEnable {
    pub patterns: Vec<FetchRequestPattern>,
    pub handle_auth_requests: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchDisable {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchHeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchContinueRequest {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<FetchHeaderEntry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailRequest {
    pub request_id: String,
    pub error_reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFulfillRequest {
    pub request_id: String,
    pub response_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<FetchHeaderEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchContinueResponse {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_phrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<FetchHeaderEntry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallengeResponse {
    pub response: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchContinueWithAuth {
    pub request_id: String,
    pub auth_challenge_response: AuthChallengeResponse,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPausedEvent {
    /// Fetch id, distinct from the Network request id
    pub request_id: String,
    pub request: CdpRequest,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub response_error_reason: Option<String>,
    #[serde(default)]
    pub response_status_code: Option<u32>,
    #[serde(default)]
    pub response_headers: Option<Vec<FetchHeaderEntry>>,
    /// The Network-domain id of the same request, when known
    #[serde(default)]
    pub network_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub realm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredEvent {
    pub request_id: String,
    pub request: CdpRequest,
    #[serde(default)]
    pub frame_id: Option<String>,
    pub auth_challenge: AuthChallenge,
    #[serde(default)]
    pub network_id: Option<String>,
}

// =========================================================================
// Tagged event dispatch
// =========================================================================

/// The finite set of CDP events the mapper consumes, plus a generic tunnel
/// for everything else.
#[derive(Debug, Clone)]
pub enum CdpEvent {
    AttachedToTarget(AttachedToTargetEvent),
    DetachedFromTarget(DetachedFromTargetEvent),
    TargetCrashed,
    FrameAttached(FrameAttachedEvent),
    FrameDetached(FrameDetachedEvent),
    FrameNavigated(FrameNavigatedEvent),
    Lifecycle(LifecycleEvent),
    DialogOpening(JavascriptDialogOpeningEvent),
    ExecutionContextCreated(ExecutionContextCreatedEvent),
    ExecutionContextDestroyed(ExecutionContextDestroyedEvent),
    ExecutionContextsCleared,
    ConsoleApiCalled(ConsoleApiCalledEvent),
    RequestWillBeSent(RequestWillBeSentEvent),
    RequestWillBeSentExtraInfo(RequestWillBeSentExtraInfoEvent),
    ResponseReceived(ResponseReceivedEvent),
    ResponseReceivedExtraInfo(ResponseReceivedExtraInfoEvent),
    LoadingFailed(LoadingFailedEvent),
    LoadingFinished(LoadingFinishedEvent),
    RequestServedFromCache(RequestServedFromCacheEvent),
    RequestPaused(RequestPausedEvent),
    AuthRequired(AuthRequiredEvent),
    Other { method: String, params: Value },
}

/// A CDP event together with the session it arrived on (None = browser)
#[derive(Debug, Clone)]
pub struct CdpEventEnvelope {
    pub session_id: Option<String>,
    pub event: CdpEvent,
}

impl CdpEvent {
    /// Parse a raw (method, params) pair into a tagged event. Payloads that
    /// fail to deserialize fall back to the generic tunnel.
    pub fn parse(method: &str, params: Value) -> CdpEvent {
        fn typed<T: serde::de::DeserializeOwned>(
            method: &str,
            params: Value,
            wrap: impl FnOnce(T) -> CdpEvent,
        ) -> CdpEvent {
            match serde_json::from_value::<T>(params.clone()) {
                Ok(ev) => wrap(ev),
                Err(err) => {
                    tracing::warn!("Malformed {} payload: {}", method, err);
                    CdpEvent::Other {
                        method: method.to_string(),
                        params,
                    }
                }
            }
        }

        match method {
            "Target.attachedToTarget" => typed(method, params, CdpEvent::AttachedToTarget),
            "Target.detachedFromTarget" => typed(method, params, CdpEvent::DetachedFromTarget),
            "Inspector.targetCrashed" => CdpEvent::TargetCrashed,
            "Page.frameAttached" => typed(method, params, CdpEvent::FrameAttached),
            "Page.frameDetached" => typed(method, params, CdpEvent::FrameDetached),
            "Page.frameNavigated" => typed(method, params, CdpEvent::FrameNavigated),
            "Page.lifecycleEvent" => typed(method, params, CdpEvent::Lifecycle),
            "Page.javascriptDialogOpening" => typed(method, params, CdpEvent::DialogOpening),
            "Runtime.executionContextCreated" => {
                typed(method, params, CdpEvent::ExecutionContextCreated)
            }
            "Runtime.executionContextDestroyed" => {
                typed(method, params, CdpEvent::ExecutionContextDestroyed)
            }
            "Runtime.executionContextsCleared" => CdpEvent::ExecutionContextsCleared,
            "Runtime.consoleAPICalled" => typed(method, params, CdpEvent::ConsoleApiCalled),
            "Network.requestWillBeSent" => typed(method, params, CdpEvent::RequestWillBeSent),
            "Network.requestWillBeSentExtraInfo" => {
                typed(method, params, CdpEvent::RequestWillBeSentExtraInfo)
            }
            "Network.responseReceived" => typed(method, params, CdpEvent::ResponseReceived),
            "Network.responseReceivedExtraInfo" => {
                typed(method, params, CdpEvent::ResponseReceivedExtraInfo)
            }
            "Network.loadingFailed" => typed(method, params, CdpEvent::LoadingFailed),
            "Network.loadingFinished" => typed(method, params, CdpEvent::LoadingFinished),
            "Network.requestServedFromCache" => {
                typed(method, params, CdpEvent::RequestServedFromCache)
            }
            "Fetch.requestPaused" => typed(method, params, CdpEvent::RequestPaused),
            "Fetch.authRequired" => typed(method, params, CdpEvent::AuthRequired),
            _ => CdpEvent::Other {
                method: method.to_string(),
                params,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_attached_to_target() {
        let event = CdpEvent::parse(
            "Target.attachedToTarget",
            json!({
                "sessionId": "s1",
                "targetInfo": {"targetId": "t1", "type": "page", "url": "about:blank"},
                "waitingForDebugger": true
            }),
        );
        match event {
            CdpEvent::AttachedToTarget(ev) => {
                assert_eq!(ev.session_id, "s1");
                assert_eq!(ev.target_info.r#type, "page");
                assert!(ev.waiting_for_debugger);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_method_goes_to_tunnel() {
        let event = CdpEvent::parse("Animation.animationStarted", json!({"id": "a"}));
        match event {
            CdpEvent::Other { method, .. } => assert_eq!(method, "Animation.animationStarted"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_falls_back_to_tunnel() {
        let event = CdpEvent::parse("Page.frameAttached", json!({"frameId": 42}));
        assert!(matches!(event, CdpEvent::Other { .. }));
    }

    #[test]
    fn fetch_enable_serializes_patterns() {
        let enable = FetchEnable {
            patterns: vec![FetchRequestPattern {
                url_pattern: "*".into(),
                request_stage: "Request",
            }],
            handle_auth_requests: true,
        };
        let value = serde_json::to_value(&enable).unwrap();
        assert_eq!(value["patterns"][0]["requestStage"], "Request");
        assert_eq!(value["handleAuthRequests"], json!(true));
    }
}
