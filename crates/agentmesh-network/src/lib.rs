//! Transport layer for agentmesh.
//!
//! A [`Transport`] is a minimal pub/sub client. [`ConnectionManager`] wraps
//! one and adds what an unreliable bus needs: reconnect with backoff, a
//! bounded outbox while disconnected, and subscriptions that survive
//! reconnects. Two transports ship here: an in-process [`MemoryBus`] and a
//! libp2p gossipsub [`GossipTransport`].

pub mod backoff;
pub mod behaviour;
pub mod error;
pub mod gossip;
pub mod manager;
pub mod memory;
pub mod transport;

pub use backoff::Backoff;
pub use behaviour::{BehaviourConfig, MeshBehaviour};
pub use error::NetworkError;
pub use gossip::{GossipConfig, GossipTransport};
pub use manager::{
    ConnectionConfig, ConnectionHealth, ConnectionManager, ConnectionStats, PublishOutcome,
    Subscription,
};
pub use memory::{MemoryBus, MemoryTransport};
pub use transport::{RawMessage, Transport};

// Re-export libp2p address types for callers configuring the gossip transport.
pub use libp2p::{Multiaddr, PeerId};
