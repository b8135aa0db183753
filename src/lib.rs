//! # bidi-mapper
//!
//! A WebDriver BiDi to Chrome DevTools Protocol mapper.
//!
//! The mapper sits between a test-automation client speaking BiDi and a
//! Chromium-family browser speaking CDP. It owns the durable state needed to
//! bridge the two: the browsing-context tree, execution realms, preload
//! scripts, network intercepts and in-flight requests, and the event
//! subscriptions with their ordering guarantees.
//!
//! The sockets stay outside: the embedder supplies a [`CdpTransport`] for
//! the CDP side and pumps text frames in both directions.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bidi_mapper::{CdpConnection, CdpTransport, MapperOptions, MapperSession};
//!
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl CdpTransport for MyTransport {
//! #     async fn send(&self, _frame: String) -> bidi_mapper::Result<()> { Ok(()) }
//! # }
//! # #[tokio::main]
//! # async fn main() -> bidi_mapper::Result<()> {
//! let (connection, cdp_events) = CdpConnection::new(Arc::new(MyTransport));
//! let (session, mut outbound) = MapperSession::new(connection.clone(), MapperOptions::default());
//! session.initialize().await?;
//!
//! tokio::spawn(async move { session.run_cdp_events(cdp_events).await });
//! // connection.handle_message(...) for every inbound CDP frame,
//! // session.handle_message(...) for every inbound BiDi frame,
//! // and forward everything from `outbound` back to the client.
//! # Ok(())
//! # }
//! ```

pub mod cdp;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod network;
pub mod preload;
pub mod processor;
pub mod protocol;
pub mod realm;
pub mod subscription;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use cdp::{CdpClient, CdpConnection, CdpEvent, CdpEventEnvelope, CdpTransport};
pub use dispatch::MapperSession;
pub use error::{CommandError, CommandResult, Error, ErrorCode, Result};
pub use processor::{BrowsingContextProcessor, MapperOptions};
