//! Per-target state machine
//!
//! Every accepted CDP target gets a CdpTarget that brings the required
//! domains up in one batch and only then releases the renderer with
//! `Runtime.runIfWaitingForDebugger`, so subscribers never miss early events
//! and preload scripts always beat user code.

use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::cdp::types::{
    FetchDisable, FetchEnable, FetchRequestPattern, NetworkDisable, NetworkEnable,
    PageAddScriptToEvaluateOnNewDocument, PageAddScriptToEvaluateOnNewDocumentResult, PageEnable,
    PageSetLifecycleEventsEnabled, RuntimeEnable, RuntimeRunIfWaitingForDebugger,
    SecuritySetIgnoreCertificateErrors, TargetSetAutoAttach,
};
use crate::cdp::CdpClient;
use crate::error::Result;
use crate::network::FetchStages;
use crate::preload::PreloadScriptStorage;

/// What kind of CDP target this is; workers get a reduced bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    Worker,
}

/// Terminal state of the unblock machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnblockOutcome {
    Ok,
    Failed(String),
}

#[derive(Default)]
struct DomainState {
    network_enabled: bool,
    fetch_stages: FetchStages,
    /// Fetch.disable wanted but deferred while requests are still paused
    pending_fetch_disable: bool,
}

/// A CDP target owned by the mapper
pub struct CdpTarget {
    target_id: String,
    session_id: String,
    kind: TargetKind,
    client: CdpClient,
    accept_insecure_certs: bool,
    unblocked: watch::Sender<Option<UnblockOutcome>>,
    domains: Mutex<DomainState>,
}

impl CdpTarget {
    pub fn new(
        target_id: impl Into<String>,
        session_id: impl Into<String>,
        kind: TargetKind,
        client: CdpClient,
        accept_insecure_certs: bool,
    ) -> std::sync::Arc<Self> {
        let (unblocked, _) = watch::channel(None);
        std::sync::Arc::new(Self {
            target_id: target_id.into(),
            session_id: session_id.into(),
            kind,
            client,
            accept_insecure_certs,
            unblocked,
            domains: Mutex::new(DomainState::default()),
        })
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    /// Run the unblock sequence. All prerequisites run as one batch and must
    /// finish before the debugger is released; the outcome resolves exactly
    /// once. A target that vanished mid-sequence counts as success, since
    /// clients can observe nothing of it.
    pub async fn unblock(
        &self,
        preload: &PreloadScriptStorage,
        top_level_id: &str,
        network_wanted: bool,
        stages: FetchStages,
    ) {
        if self.unblocked.borrow().is_some() {
            return;
        }

        let prerequisites = match self.kind {
            TargetKind::Page => {
                tokio::try_join!(
                    self.enable_runtime(),
                    self.enable_page(),
                    self.set_certificate_policy(),
                    self.sync_network_domains(network_wanted, stages, false),
                    self.set_auto_attach(),
                    self.install_preload_scripts(preload, top_level_id),
                )
                .map(|_| ())
            }
            // Workers have no Page domain and no descendants to auto-attach
            TargetKind::Worker => self.enable_runtime().await,
        };

        let outcome = match prerequisites {
            Ok(()) => match self
                .client
                .send_command::<_, Value>(
                    "Runtime.runIfWaitingForDebugger",
                    &RuntimeRunIfWaitingForDebugger {},
                )
                .await
            {
                Ok(_) => UnblockOutcome::Ok,
                Err(err) if err.is_close() => UnblockOutcome::Ok,
                Err(err) => UnblockOutcome::Failed(err.to_string()),
            },
            Err(err) if err.is_close() => UnblockOutcome::Ok,
            Err(err) => {
                tracing::debug!("Unblock of {} failed: {}", self.target_id, err);
                UnblockOutcome::Failed(err.to_string())
            }
        };
        self.resolve(outcome);
    }

    /// Wait until the unblock machine reached a terminal state
    pub async fn wait_unblocked(&self) -> UnblockOutcome {
        let mut rx = self.unblocked.subscribe();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return UnblockOutcome::Ok;
            }
        }
    }

    fn resolve(&self, outcome: UnblockOutcome) {
        self.unblocked.send_if_modified(|state| {
            debug_assert!(state.is_none(), "unblock resolved twice");
            if state.is_none() {
                *state = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    async fn enable_runtime(&self) -> Result<()> {
        self.client
            .send_command::<_, Value>("Runtime.enable", &RuntimeEnable {})
            .await?;
        Ok(())
    }

    async fn enable_page(&self) -> Result<()> {
        self.client
            .send_command::<_, Value>("Page.enable", &PageEnable {})
            .await?;
        self.client
            .send_command::<_, Value>(
                "Page.setLifecycleEventsEnabled",
                &PageSetLifecycleEventsEnabled { enabled: true },
            )
            .await?;
        Ok(())
    }

    async fn set_certificate_policy(&self) -> Result<()> {
        self.client
            .send_command::<_, Value>(
                "Security.setIgnoreCertificateErrors",
                &SecuritySetIgnoreCertificateErrors {
                    ignore: self.accept_insecure_certs,
                },
            )
            .await?;
        Ok(())
    }

    async fn set_auto_attach(&self) -> Result<()> {
        self.client
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

    async fn install_preload_scripts(
        &self,
        preload: &PreloadScriptStorage,
        top_level_id: &str,
    ) -> Result<()> {
        for script in preload.matching(top_level_id).await {
            let cdp_id = self.install_script(&script.source, script.sandbox.as_deref()).await?;
            preload
                .record_cdp_id(&script.id, &self.target_id, cdp_id)
                .await;
        }
        Ok(())
    }

    /// Install one script on this target, returning the CDP identifier
    pub async fn install_script(&self, source: &str, sandbox: Option<&str>) -> Result<String> {
        let result: PageAddScriptToEvaluateOnNewDocumentResult = self
            .client
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                &PageAddScriptToEvaluateOnNewDocument {
                    source: source.to_string(),
                    world_name: sandbox.map(String::from),
                    run_immediately: Some(true),
                },
            )
            .await?;
        Ok(result.identifier)
    }

    /// Bring the Network and Fetch domains in line with what subscribers and
    /// intercepts require. Stage changes are recorded only after the CDP
    /// command succeeded; a wanted Fetch.disable is deferred while requests
    /// are still paused, since CDP would orphan them.
    pub async fn sync_network_domains(
        &self,
        network_wanted: bool,
        stages: FetchStages,
        has_paused_requests: bool,
    ) -> Result<()> {
        let mut domains = self.domains.lock().await;

        if network_wanted != domains.network_enabled {
            if network_wanted {
                self.client
                    .send_command::<_, Value>(
                        "Network.enable",
                        &NetworkEnable {
                            max_post_data_size: Some(65536),
                        },
                    )
                    .await?;
            } else {
                self.client
                    .send_command::<_, Value>("Network.disable", &NetworkDisable {})
                    .await?;
            }
            domains.network_enabled = network_wanted;
        }

        if stages != domains.fetch_stages {
            if stages.is_active() {
                // Fetch relies on Network being enabled
                if domains.network_enabled {
                    self.client
                        .send_command::<_, Value>("Fetch.enable", &fetch_enable_params(stages))
                        .await?;
                    domains.fetch_stages = stages;
                    domains.pending_fetch_disable = false;
                }
            } else if has_paused_requests {
                domains.pending_fetch_disable = true;
            } else {
                self.client
                    .send_command::<_, Value>("Fetch.disable", &FetchDisable {})
                    .await?;
                domains.fetch_stages = FetchStages::default();
                domains.pending_fetch_disable = false;
            }
        }
        Ok(())
    }

    /// Complete a deferred Fetch.disable once the last paused request on
    /// this target reached a terminal phase
    pub async fn flush_fetch_disable(&self, still_paused: bool) -> Result<()> {
        let mut domains = self.domains.lock().await;
        if !domains.pending_fetch_disable || still_paused {
            return Ok(());
        }
        self.client
            .send_command::<_, Value>("Fetch.disable", &FetchDisable {})
            .await?;
        domains.fetch_stages = FetchStages::default();
        domains.pending_fetch_disable = false;
        Ok(())
    }
}

fn fetch_enable_params(stages: FetchStages) -> FetchEnable {
    let mut patterns = Vec::new();
    if stages.request || stages.auth {
        patterns.push(FetchRequestPattern {
            url_pattern: "*".into(),
            request_stage: "Request",
        });
    }
    if stages.response {
        patterns.push(FetchRequestPattern {
            url_pattern: "*".into(),
            request_stage: "Response",
        });
    }
    FetchEnable {
        patterns,
        handle_auth_requests: stages.auth,
    }
}
