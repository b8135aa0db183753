//! Shared helpers for unit tests: a recording fake CDP endpoint

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::cdp::{CdpClient, CdpConnection, CdpEventEnvelope, CdpTransport};
use crate::error::Result;

/// Transport that swallows frames; for stubs that never await a response
pub struct NullTransport;

#[async_trait]
impl CdpTransport for NullTransport {
    async fn send(&self, _frame: String) -> Result<()> {
        Ok(())
    }
}

/// A client whose commands would never resolve; good enough for entities
/// that only need a session identity
pub fn stub_client(session: &str) -> CdpClient {
    let (connection, _events) = CdpConnection::new(Arc::new(NullTransport));
    connection.session_client(session)
}

struct ChannelTransport {
    frames: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl CdpTransport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| crate::error::Error::transport("fake endpoint gone"))?;
        Ok(())
    }
}

/// A fake CDP endpoint: records every command, answers each one (with `{}`
/// unless overridden), and lets tests inject events.
pub struct FakeCdp {
    pub connection: Arc<CdpConnection>,
    pub commands: Arc<Mutex<Vec<Value>>>,
    results: Arc<Mutex<HashMap<String, Value>>>,
    errors: Arc<Mutex<HashMap<String, (i64, String)>>>,
}

impl FakeCdp {
    pub fn new() -> (Self, mpsc::Receiver<CdpEventEnvelope>) {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
        let (connection, events) = CdpConnection::new(Arc::new(ChannelTransport {
            frames: frame_tx,
        }));

        let commands: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let results: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let errors: Arc<Mutex<HashMap<String, (i64, String)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let responder_connection = Arc::clone(&connection);
        let responder_commands = Arc::clone(&commands);
        let responder_results = Arc::clone(&results);
        let responder_errors = Arc::clone(&errors);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let value: Value = serde_json::from_str(&frame).expect("fake got non-JSON frame");
                let id = value["id"].clone();
                let method = value["method"].as_str().unwrap_or("").to_string();
                responder_commands.lock().await.push(value);

                let reply = if let Some((code, message)) =
                    responder_errors.lock().await.get(&method).cloned()
                {
                    json!({"id": id, "error": {"code": code, "message": message}})
                } else {
                    let result = responder_results
                        .lock()
                        .await
                        .get(&method)
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    json!({"id": id, "result": result})
                };
                responder_connection.handle_message(&reply.to_string()).await;
            }
        });

        (
            Self {
                connection,
                commands,
                results,
                errors,
            },
            events,
        )
    }

    /// Make every future call of `method` return `result`
    pub async fn set_result(&self, method: &str, result: Value) {
        self.results.lock().await.insert(method.to_string(), result);
    }

    /// Make every future call of `method` fail
    pub async fn set_error(&self, method: &str, code: i64, message: &str) {
        self.errors
            .lock()
            .await
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Recorded commands with the given method, in send order
    pub async fn commands_named(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .await
            .iter()
            .filter(|c| c["method"] == method)
            .cloned()
            .collect()
    }

    /// Method names of all recorded commands, in send order
    pub async fn command_methods(&self) -> Vec<String> {
        self.commands
            .lock()
            .await
            .iter()
            .map(|c| c["method"].as_str().unwrap_or("").to_string())
            .collect()
    }

    /// Inject a CDP event frame as if the browser sent it
    pub async fn inject(&self, method: &str, session: Option<&str>, params: Value) {
        let mut frame = json!({"method": method, "params": params});
        if let Some(session) = session {
            frame["sessionId"] = json!(session);
        }
        self.connection.handle_message(&frame.to_string()).await;
    }
}
