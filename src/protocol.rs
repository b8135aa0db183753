//! Hand-written BiDi wire types for the commands and events the mapper speaks
//!
//! Command params are deserialized from the client, results and events are
//! serialized back. Only the fields the mapper actually consumes are modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// An incoming BiDi command envelope.
///
/// `id` and `method` are optional so that a malformed frame can still be
/// reported: a frame that parses as JSON but misses fields is answered with
/// an error echoing whatever id was present.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub id: Option<u64>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Outgoing success frame
#[derive(Debug, Clone, Serialize)]
pub struct SuccessFrame {
    pub id: u64,
    pub r#type: &'static str,
    pub result: Value,
}

/// Outgoing error frame. `id` is omitted for unparseable input.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub r#type: &'static str,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

/// Outgoing event frame
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub r#type: &'static str,
    pub method: String,
    pub params: Value,
}

impl SuccessFrame {
    pub fn new(id: u64, result: Value) -> Self {
        Self {
            id,
            r#type: "success",
            result,
        }
    }
}

impl ErrorFrame {
    pub fn new(id: Option<u64>, error: &CommandError) -> Self {
        Self {
            id,
            r#type: "error",
            error: error.code.as_str(),
            message: error.message.clone(),
            stacktrace: None,
        }
    }
}

impl EventFrame {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            r#type: "event",
            method: method.into(),
            params,
        }
    }
}

/// Document readiness, ordered so waits can compare against a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    #[default]
    None,
    Interactive,
    Complete,
}

/// A BiDi header: name plus a string-typed value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: BytesValue,
}

/// BiDi bytes value, either plain text or base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BytesValue {
    String { value: String },
    Base64 { value: String },
}

impl Header {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: BytesValue::String {
                value: value.into(),
            },
        }
    }
}

/// Convert a CDP header map into the BiDi list form, sorted for stable output
pub fn headers_from_cdp(headers: &std::collections::HashMap<String, String>) -> Vec<Header> {
    let mut out: Vec<Header> = headers
        .iter()
        .map(|(name, value)| Header::string(name.clone(), value.clone()))
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

// =========================================================================
// session.*
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeParams {
    pub events: Vec<String>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeParams {
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResult {
    pub subscription: String,
}

// =========================================================================
// browsingContext.*
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateType {
    Tab,
    Window,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub r#type: CreateType,
    #[serde(default)]
    pub reference_context: Option<String>,
    #[serde(default)]
    pub user_context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResult {
    pub context: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateParams {
    pub context: String,
    pub url: String,
    #[serde(default)]
    pub wait: Option<ReadinessState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigateResult {
    pub navigation: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseParams {
    pub context: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTreeParams {
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetTreeResult {
    pub contexts: Vec<ContextInfo>,
}

/// Tree node returned by getTree and carried on context events
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub context: String,
    pub url: String,
    pub user_context: String,
    pub children: Option<Vec<ContextInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetViewportParams {
    pub context: String,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub device_pixel_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleUserPromptParams {
    pub context: String,
    #[serde(default)]
    pub accept: Option<bool>,
    #[serde(default)]
    pub user_text: Option<String>,
}

// =========================================================================
// network.*
// =========================================================================

/// Interception phase names on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptPhase {
    BeforeRequestSent,
    ResponseStarted,
    AuthRequired,
}

/// UrlPattern wire form: literal string or component pattern
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UrlPatternSpec {
    String {
        pattern: String,
    },
    #[serde(rename_all = "camelCase")]
    Pattern {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        pathname: Option<String>,
        #[serde(default)]
        search: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInterceptParams {
    pub phases: Vec<InterceptPhase>,
    #[serde(default)]
    pub url_patterns: Option<Vec<UrlPatternSpec>>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddInterceptResult {
    pub intercept: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveInterceptParams {
    pub intercept: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContinueRequestParams {
    pub request: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailRequestParams {
    pub request: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvideResponseParams {
    pub request: String,
    #[serde(default)]
    pub status_code: Option<u32>,
    #[serde(default)]
    pub reason_phrase: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
    #[serde(default)]
    pub body: Option<BytesValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseParams {
    pub request: String,
    #[serde(default)]
    pub status_code: Option<u32>,
    #[serde(default)]
    pub reason_phrase: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContinueWithAuthAction {
    Default,
    Cancel,
    ProvideCredentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContinueWithAuthParams {
    pub request: String,
    pub action: ContinueWithAuthAction,
    #[serde(default)]
    pub credentials: Option<AuthCredentials>,
}

/// Request description embedded in every network event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub request: String,
    pub url: String,
    pub method: String,
    pub headers: Vec<Header>,
}

/// Response description for responseStarted / responseCompleted
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    pub url: String,
    pub status: u32,
    pub status_text: String,
    pub headers: Vec<Header>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRequestSentEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepts: Option<Vec<String>>,
    pub redirect_count: u32,
    pub request: RequestData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStartedEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepts: Option<Vec<String>>,
    pub redirect_count: u32,
    pub request: RequestData,
    pub response: ResponseData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCompletedEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub redirect_count: u32,
    pub request: RequestData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub redirect_count: u32,
    pub request: RequestData,
    pub error_text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepts: Option<Vec<String>>,
    pub request: RequestData,
    pub response: ResponseData,
}

// =========================================================================
// script.*
// =========================================================================

/// Channel argument on addPreloadScript; only the channel id is retained
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelValue {
    Channel { value: ChannelProperties },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProperties {
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPreloadScriptParams {
    pub function_declaration: String,
    #[serde(default)]
    pub arguments: Option<Vec<ChannelValue>>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
    #[serde(default)]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddPreloadScriptResult {
    pub script: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemovePreloadScriptParams {
    pub script: String,
}

// =========================================================================
// cdp.* passthrough
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CdpSendCommandParams {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CdpSendCommandResult {
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}
