use std::time::Duration;

use agentmesh_network::NetworkError;
use agentmesh_protocol::ProtocolError;
use agentmesh_store::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("could not build envelope: {0}")]
    Protocol(#[from] ProtocolError),

    /// The send failed outright. Link outages are buffered, not reported here.
    #[error("publish failed: {0}")]
    Publish(#[from] NetworkError),

    #[error("no response to {request_id} within {after:?}")]
    Timeout { request_id: String, after: Duration },

    #[error("request {0} cancelled before a response arrived")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport: {0}")]
    Connection(#[from] NetworkError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("agent runtime is shut down")]
    ShutDown,
}
