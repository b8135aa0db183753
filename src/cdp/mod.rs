//! CDP plumbing: wire types, the transport seam, and per-session clients

pub mod client;
pub mod types;

pub use client::{CdpClient, CdpConnection, CdpTransport};
pub use types::{CdpEvent, CdpEventEnvelope};
