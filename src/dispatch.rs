//! BiDi command dispatch
//!
//! Decodes incoming command frames, routes them to the processor, and
//! encodes results and errors back onto the outbound channel. The embedder
//! owns the sockets; the session only sees text frames in both directions.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cdp::{CdpConnection, CdpEventEnvelope};
use crate::context::BrowsingContextStorage;
use crate::error::{CommandError, CommandResult, Result};
use crate::event::EventManager;
use crate::network::NetworkStorage;
use crate::preload::PreloadScriptStorage;
use crate::processor::{BrowsingContextProcessor, MapperOptions};
use crate::protocol::{CommandEnvelope, ErrorFrame, SuccessFrame};
use crate::realm::RealmStorage;

/// One BiDi session over one CDP connection
pub struct MapperSession {
    processor: BrowsingContextProcessor,
    outbound: mpsc::Sender<String>,
}

impl MapperSession {
    /// Build a session over an established CDP connection. Returns the
    /// session and the receiver of outbound BiDi frames (responses and
    /// events alike).
    pub fn new(
        connection: Arc<CdpConnection>,
        options: MapperOptions,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let contexts = BrowsingContextStorage::new();
        let events = EventManager::new(outbound_tx.clone(), contexts.clone());
        let realms = RealmStorage::new();
        let preload = PreloadScriptStorage::new();
        let network = NetworkStorage::new(events.clone(), contexts.clone());
        let processor = BrowsingContextProcessor::new(
            connection, events, contexts, realms, preload, network, options,
        );
        (
            Self {
                processor,
                outbound: outbound_tx,
            },
            outbound_rx,
        )
    }

    pub fn processor(&self) -> &BrowsingContextProcessor {
        &self.processor
    }

    /// Kick off target discovery; call once after construction
    pub async fn initialize(&self) -> Result<()> {
        self.processor.initialize().await
    }

    /// Drain CDP events into the processor until the connection ends
    pub async fn run_cdp_events(&self, mut events: mpsc::Receiver<CdpEventEnvelope>) {
        while let Some(envelope) = events.recv().await {
            self.processor.handle_cdp_event(envelope).await;
        }
        tracing::debug!("CDP event stream ended");
    }

    /// Handle one inbound BiDi frame. Commands run as their own tasks so a
    /// handler that waits on browser events never stalls the session.
    pub async fn handle_message(&self, raw: &str) {
        let envelope: CommandEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Unparseable input: the error frame carries no id
                self.send_error(None, &CommandError::invalid_argument(format!(
                    "Cannot parse command: {err}"
                )))
                .await;
                return;
            }
        };

        let Some(method) = envelope.method else {
            self.send_error(
                envelope.id,
                &CommandError::invalid_argument("Missing 'method'"),
            )
            .await;
            return;
        };
        let Some(id) = envelope.id else {
            self.send_error(None, &CommandError::invalid_argument("Missing 'id'"))
                .await;
            return;
        };

        let processor = self.processor.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let frame = match dispatch_command(&processor, &method, envelope.params).await {
                Ok(result) => serde_json::to_string(&SuccessFrame::new(id, result)),
                Err(error) => {
                    tracing::debug!("Command {} failed: {}", method, error);
                    serde_json::to_string(&ErrorFrame::new(Some(id), &error))
                }
            };
            match frame {
                Ok(text) => {
                    let _ = outbound.send(text).await;
                }
                Err(err) => tracing::warn!("Failed to serialize response: {}", err),
            }
        });
    }

    async fn send_error(&self, id: Option<u64>, error: &CommandError) {
        if let Ok(text) = serde_json::to_string(&ErrorFrame::new(id, error)) {
            let _ = self.outbound.send(text).await;
        }
    }
}

/// Decode the method name, parse params, and call the handler
async fn dispatch_command(
    processor: &BrowsingContextProcessor,
    method: &str,
    params: Value,
) -> CommandResult {
    match method {
        "session.subscribe" => processor.subscribe(parse(params)?).await,
        "session.unsubscribe" => processor.unsubscribe(parse(params)?).await,
        "browsingContext.create" => processor.context_create(parse(params)?).await,
        "browsingContext.navigate" => processor.context_navigate(parse(params)?).await,
        "browsingContext.close" => processor.context_close(parse(params)?).await,
        "browsingContext.getTree" => processor.context_get_tree(parse(params)?).await,
        "browsingContext.setViewport" => processor.context_set_viewport(parse(params)?).await,
        "browsingContext.handleUserPrompt" => {
            processor.context_handle_user_prompt(parse(params)?).await
        }
        "network.addIntercept" => processor.network_add_intercept(parse(params)?).await,
        "network.removeIntercept" => processor.network_remove_intercept(parse(params)?).await,
        "network.continueRequest" => processor.network_continue_request(parse(params)?).await,
        "network.failRequest" => processor.network_fail_request(parse(params)?).await,
        "network.provideResponse" => processor.network_provide_response(parse(params)?).await,
        "network.continueResponse" => processor.network_continue_response(parse(params)?).await,
        "network.continueWithAuth" => processor.network_continue_with_auth(parse(params)?).await,
        "script.addPreloadScript" => processor.script_add_preload(parse(params)?).await,
        "script.removePreloadScript" => processor.script_remove_preload(parse(params)?).await,
        "cdp.sendCommand" => processor.cdp_send_command(parse(params)?).await,
        _ => Err(CommandError::unknown_command(method)),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> std::result::Result<T, CommandError> {
    // An omitted params field reaches us as null; treat it as empty
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|err| CommandError::invalid_argument(format!("Invalid params: {err}")))
}
