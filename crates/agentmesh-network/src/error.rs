use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// Transport unreachable. Recovered by reconnecting with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single send failed while the link itself is up.
    #[error("publish error: {0}")]
    Publish(String),

    /// Link is up but no peer is subscribed to the channel yet.
    #[error("no peers subscribed")]
    NoPeers,

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("behaviour error: {0}")]
    Behaviour(String),

    #[error("connection manager is closed")]
    Closed,
}

impl NetworkError {
    /// Whether the failure means the link is down rather than a one-off send error.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
