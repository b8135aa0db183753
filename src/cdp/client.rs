//! CDP connection and per-session clients
//!
//! The raw socket is an external collaborator; the connection only sees a
//! [`CdpTransport`] it can write frames to, and the embedder feeds every
//! inbound frame into [`CdpConnection::handle_message`]. Responses are routed
//! to pending commands by id, events are fanned into a single channel tagged
//! with their session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::types::{CdpEvent, CdpEventEnvelope};
use crate::error::{Error, Result};

/// Outbound half of the CDP socket
#[async_trait]
pub trait CdpTransport: Send + Sync {
    /// Write one JSON text frame
    async fn send(&self, frame: String) -> Result<()>;
}

/// A pending command waiting for its response
type PendingCommand = oneshot::Sender<Result<Value>>;

/// A CDP connection shared by the browser session and all target sessions
pub struct CdpConnection {
    transport: Arc<dyn CdpTransport>,
    /// Next message ID
    next_id: AtomicU64,
    /// Pending commands waiting for responses
    pending: Mutex<HashMap<u64, PendingCommand>>,
    /// Channel carrying parsed events to the processor
    event_tx: mpsc::Sender<CdpEventEnvelope>,
}

impl CdpConnection {
    /// Wrap a transport. Returns the connection plus the receiver the
    /// processor drains events from.
    pub fn new(transport: Arc<dyn CdpTransport>) -> (Arc<Self>, mpsc::Receiver<CdpEventEnvelope>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let connection = Arc::new(Self {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            event_tx,
        });
        (connection, event_rx)
    }

    /// Client for the browser-level session
    pub fn browser_client(self: &Arc<Self>) -> CdpClient {
        CdpClient {
            connection: Arc::clone(self),
            session_id: None,
        }
    }

    /// Client bound to a flat-mode session
    pub fn session_client(self: &Arc<Self>, session_id: impl Into<String>) -> CdpClient {
        CdpClient {
            connection: Arc::clone(self),
            session_id: Some(session_id.into()),
        }
    }

    /// Feed one inbound frame from the socket. Responses resolve pending
    /// commands; events go to the event channel; garbage is logged and
    /// dropped, never thrown back at the transport.
    pub async fn handle_message(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("Failed to parse CDP frame: {} - {}", err, raw);
                return;
            }
        };

        if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
            let result = if let Some(error) = msg.get("error") {
                Err(Error::cdp(
                    msg.get("method").and_then(|m| m.as_str()).unwrap_or(""),
                    error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
                    error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown"),
                ))
            } else {
                Ok(msg.get("result").cloned().unwrap_or(json!({})))
            };

            let sender = self.pending.lock().await.remove(&id);
            match sender {
                Some(sender) => {
                    let _ = sender.send(result);
                }
                None => tracing::trace!("Response for unknown id: {}", id),
            }
        } else if let Some(method) = msg.get("method").and_then(|m| m.as_str()) {
            let params = msg.get("params").cloned().unwrap_or(json!({}));
            let session_id = msg
                .get("sessionId")
                .and_then(|s| s.as_str())
                .map(String::from);

            let envelope = CdpEventEnvelope {
                session_id,
                event: CdpEvent::parse(method, params),
            };
            if self.event_tx.send(envelope).await.is_err() {
                tracing::debug!("Event channel closed, dropping {}", method);
            }
        }
    }

    /// Fail every pending command; call when the socket is gone
    pub async fn close(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(Error::Closed("CDP connection closed".into())));
        }
    }

    async fn send_command_raw(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = json!(session_id);
        }

        let frame = serde_json::to_string(&msg)?;
        tracing::trace!("Sent CDP command: {} (id={}, session={:?})", method, id, session_id);

        if let Err(err) = self.transport.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        rx.await
            .map_err(|_| Error::ChannelClosed(format!("response for {method}")))?
    }
}

/// A command handle bound to one session (or the browser session)
#[derive(Clone)]
pub struct CdpClient {
    connection: Arc<CdpConnection>,
    session_id: Option<String>,
}

impl CdpClient {
    /// The session this client routes to, None for the browser session
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send a typed command and deserialize its result
    pub async fn send_command<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let result = self
            .connection
            .send_command_raw(self.session_id(), method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a command with raw JSON params, returning the raw result
    pub async fn send_command_raw(&self, method: &str, params: Value) -> Result<Value> {
        self.connection
            .send_command_raw(self.session_id(), method, params)
            .await
    }
}

impl std::fmt::Debug for CdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpClient")
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport that records frames and lets tests answer them
    struct RecordingTransport {
        frames: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl CdpTransport for RecordingTransport {
        async fn send(&self, frame: String) -> Result<()> {
            self.frames.lock().await.push(serde_json::from_str(&frame)?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn command_round_trip() {
        let transport = Arc::new(RecordingTransport {
            frames: Mutex::new(Vec::new()),
        });
        let (connection, _events) = CdpConnection::new(transport.clone());

        let conn = Arc::clone(&connection);
        let pending = tokio::spawn(async move {
            conn.session_client("sess-1")
                .send_command_raw("Page.enable", json!({}))
                .await
                .unwrap()
        });

        // Wait for the frame to be written, then answer it
        let frame = loop {
            if let Some(frame) = transport.frames.lock().await.first().cloned() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(frame["method"], "Page.enable");
        assert_eq!(frame["sessionId"], "sess-1");

        let response = json!({"id": frame["id"], "result": {"ok": true}}).to_string();
        connection.handle_message(&response).await;

        assert_eq!(pending.await.unwrap()["ok"], json!(true));
    }

    #[tokio::test]
    async fn error_response_becomes_cdp_error() {
        let transport = Arc::new(RecordingTransport {
            frames: Mutex::new(Vec::new()),
        });
        let (connection, _events) = CdpConnection::new(transport.clone());

        let conn = Arc::clone(&connection);
        let pending = tokio::spawn(async move {
            conn.browser_client()
                .send_command_raw("Target.createTarget", json!({}))
                .await
        });

        let frame = loop {
            if let Some(frame) = transport.frames.lock().await.first().cloned() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        let response = json!({
            "id": frame["id"],
            "error": {"code": -32602, "message": "Invalid parameters"}
        })
        .to_string();
        connection.handle_message(&response).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cdp { code: -32602, .. }));
    }

    #[tokio::test]
    async fn events_carry_session_id() {
        let transport = Arc::new(RecordingTransport {
            frames: Mutex::new(Vec::new()),
        });
        let (connection, mut events) = CdpConnection::new(transport);

        connection
            .handle_message(
                &json!({
                    "method": "Page.lifecycleEvent",
                    "sessionId": "sess-9",
                    "params": {"frameId": "f1", "loaderId": "l1", "name": "load"}
                })
                .to_string(),
            )
            .await;

        let envelope = events.recv().await.unwrap();
        assert_eq!(envelope.session_id.as_deref(), Some("sess-9"));
        assert!(matches!(envelope.event, CdpEvent::Lifecycle(_)));
    }

    #[tokio::test]
    async fn close_fails_pending_commands() {
        let transport = Arc::new(RecordingTransport {
            frames: Mutex::new(Vec::new()),
        });
        let (connection, _events) = CdpConnection::new(transport);

        let conn = Arc::clone(&connection);
        let pending =
            tokio::spawn(async move { conn.browser_client().send_command_raw("Browser.getVersion", json!({})).await });

        tokio::task::yield_now().await;
        connection.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_close());
    }
}
