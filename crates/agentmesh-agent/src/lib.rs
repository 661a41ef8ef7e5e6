//! agentmesh agent runtime.
//!
//! Ties the transport, registry, interaction tracker and message log of one
//! local agent together behind [`AgentRuntime`]: it announces the agent's
//! capabilities, keeps the registry fresh, routes inbound envelopes to
//! handlers, and shuts everything down within a bounded grace period.

pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod router;
pub mod runtime;

pub use config::{AgentConfig, ConfigError, TransportKind};
pub use discovery::{DiscoveryFilter, DiscoveryProtocol, DiscoveryState};
pub use error::{RouterError, RuntimeError};
pub use handler::{
    HandlerContext, MessageHandler, WorkQueue, WorkQueueError, WorkQueueStats, WorkerHandle,
};
pub use router::{InboundOutcome, MessageSender, RouterStats, SendReceipt};
pub use runtime::{AgentHealth, AgentRuntime, AgentRuntimeBuilder, ShutdownReport};
