//! Transport contract consumed by the connection manager.
//!
//! A transport is a capability-bounded pub/sub client: it can connect,
//! publish raw bytes to a named channel, subscribe to a channel, and report
//! whether it is currently usable. Reconnection, buffering, and
//! resubscription live in [`crate::ConnectionManager`], not here.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::NetworkError;

/// A raw inbound message, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub channel: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the link. Idempotent while connected.
    async fn connect(&self) -> Result<(), NetworkError>;

    /// Fire-and-forget publish. At-most-once, no replay.
    ///
    /// Returns [`NetworkError::Connection`] when the link is down, so the
    /// caller can buffer and reconnect.
    async fn publish(&self, channel: &str, data: Vec<u8>) -> Result<(), NetworkError>;

    /// Subscribe to `channel`. The receiver ending means the link was lost.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<RawMessage>, NetworkError>;

    /// Current usability of the link. Must not have side effects.
    async fn health_check(&self) -> bool;

    /// Release the link and end all subscriptions.
    async fn disconnect(&self);

    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;
}
