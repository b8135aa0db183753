//! Per-request lifecycle state
//!
//! One entry per in-flight request, keyed by the CDP Network request id
//! (which doubles as the BiDi request id). The entry survives redirects;
//! each redirect resets the per-attempt fields and bumps the redirect count.

use std::collections::HashMap;

use crate::cdp::types::{CdpRequest, CdpResponse};
use crate::cdp::CdpClient;
use crate::protocol::{headers_from_cdp, InterceptPhase, RequestData, ResponseData};

/// An in-flight network request
pub struct NetworkRequest {
    pub id: String,
    /// Client of the session the request lives on, used for Fetch commands
    pub client: CdpClient,
    /// Frame the request belongs to, when CDP told us
    pub context: Option<String>,
    pub url: String,
    pub method: String,
    headers: HashMap<String, String>,
    /// Raw headers from requestWillBeSentExtraInfo; may arrive before or
    /// after the primary event
    extra_headers: Option<HashMap<String, String>>,
    pub redirect_count: u32,
    /// Fetch-domain id, set while paused
    pub fetch_id: Option<String>,
    /// Phase the request is currently parked in
    pub phase: Option<InterceptPhase>,
    /// Intercepts blocking the current phase
    pub blocked_by: Vec<String>,
    pub served_from_cache: bool,
    response: Option<CdpResponse>,
    response_extra_headers: Option<HashMap<String, String>>,
    pub before_request_sent_emitted: bool,
    pub response_started_emitted: bool,
}

impl NetworkRequest {
    pub fn new(
        id: impl Into<String>,
        client: CdpClient,
        context: Option<String>,
        request: &CdpRequest,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            context,
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            extra_headers: None,
            redirect_count: 0,
            fetch_id: None,
            phase: None,
            blocked_by: Vec::new(),
            served_from_cache: false,
            response: None,
            response_extra_headers: None,
            before_request_sent_emitted: false,
            response_started_emitted: false,
        }
    }

    /// Whether the request is parked waiting for a client decision
    pub fn is_paused(&self) -> bool {
        self.phase.is_some()
    }

    /// Park the request in a phase, blocked by the given intercepts
    pub fn park(&mut self, phase: InterceptPhase, blocked_by: Vec<String>) {
        self.phase = Some(phase);
        self.blocked_by = blocked_by;
    }

    /// Release the parked state after a continue/fail/provide decision
    pub fn release(&mut self) {
        self.phase = None;
        self.blocked_by.clear();
        self.fetch_id = None;
    }

    /// Start the next attempt after a redirect: per-attempt state resets,
    /// the id and redirect count carry over
    pub fn begin_redirect(&mut self, request: &CdpRequest) {
        self.redirect_count += 1;
        self.url = request.url.clone();
        self.method = request.method.clone();
        self.headers = request.headers.clone();
        self.extra_headers = None;
        self.fetch_id = None;
        self.phase = None;
        self.blocked_by.clear();
        self.response = None;
        self.response_extra_headers = None;
        self.before_request_sent_emitted = false;
        self.response_started_emitted = false;
        self.served_from_cache = false;
    }

    pub fn merge_request_extra_info(&mut self, headers: HashMap<String, String>) {
        self.extra_headers = Some(headers);
    }

    pub fn set_response(&mut self, response: CdpResponse) {
        self.response = Some(response);
    }

    pub fn merge_response_extra_info(&mut self, headers: HashMap<String, String>) {
        self.response_extra_headers = Some(headers);
    }

    pub fn response(&self) -> Option<&CdpResponse> {
        self.response.as_ref()
    }

    /// BiDi view of the request: primary headers merged with extra-info
    pub fn request_data(&self) -> RequestData {
        let mut headers = self.headers.clone();
        if let Some(extra) = &self.extra_headers {
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }
        RequestData {
            request: self.id.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            headers: headers_from_cdp(&headers),
        }
    }

    /// BiDi view of the response, if one was observed
    pub fn response_data(&self) -> Option<ResponseData> {
        let response = self.response.as_ref()?;
        Some(self.response_data_from(response))
    }

    /// BiDi view of an arbitrary CDP response (redirect responses come from
    /// the next requestWillBeSent, not from this entry)
    pub fn response_data_from(&self, response: &CdpResponse) -> ResponseData {
        let mut headers = response.headers.clone();
        if let Some(extra) = &self.response_extra_headers {
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }
        ResponseData {
            url: response.url.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: headers_from_cdp(&headers),
            mime_type: response.mime_type.clone(),
            from_cache: self.served_from_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::stub_client;

    fn request(url: &str) -> CdpRequest {
        CdpRequest {
            url: url.into(),
            method: "GET".into(),
            headers: HashMap::from([("Accept".to_string(), "*/*".to_string())]),
        }
    }

    #[tokio::test]
    async fn extra_info_merges_into_request_headers() {
        let mut req = NetworkRequest::new(
            "r1",
            stub_client("sess"),
            Some("ctx".into()),
            &request("http://example.com/"),
        );
        req.merge_request_extra_info(HashMap::from([(
            "Cookie".to_string(),
            "a=1".to_string(),
        )]));

        let data = req.request_data();
        assert_eq!(data.request, "r1");
        let names: Vec<&str> = data.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Accept", "Cookie"]);
    }

    #[tokio::test]
    async fn redirect_resets_attempt_state_but_keeps_identity() {
        let mut req = NetworkRequest::new(
            "r1",
            stub_client("sess"),
            Some("ctx".into()),
            &request("http://example.com/a"),
        );
        req.fetch_id = Some("f1".into());
        req.park(InterceptPhase::BeforeRequestSent, vec!["i1".into()]);
        req.set_response(CdpResponse {
            url: "http://example.com/a".into(),
            status: 302,
            status_text: "Found".into(),
            headers: HashMap::new(),
            mime_type: None,
        });

        req.begin_redirect(&request("http://example.com/b"));
        assert_eq!(req.id, "r1");
        assert_eq!(req.redirect_count, 1);
        assert_eq!(req.url, "http://example.com/b");
        assert!(req.fetch_id.is_none());
        assert!(!req.is_paused());
        assert!(req.response().is_none());
    }

    #[tokio::test]
    async fn served_from_cache_reflects_in_response_data() {
        let mut req = NetworkRequest::new(
            "r1",
            stub_client("sess"),
            None,
            &request("http://example.com/"),
        );
        req.served_from_cache = true;
        req.set_response(CdpResponse {
            url: "http://example.com/".into(),
            status: 200,
            status_text: "OK".into(),
            headers: HashMap::new(),
            mime_type: Some("text/html".into()),
        });
        assert!(req.response_data().unwrap().from_cache);
    }
}
