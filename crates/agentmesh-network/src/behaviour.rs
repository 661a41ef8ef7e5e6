//! Composite libp2p behaviour: gossipsub for pub/sub plus optional mDNS for
//! zero-configuration peer discovery on the local network.

use std::time::Duration;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identity, mdns};

use crate::NetworkError;

/// Configuration for [`MeshBehaviour`].
#[derive(Debug, Clone)]
pub struct BehaviourConfig {
    /// Gossipsub heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Enable mDNS discovery of peers on the LAN.
    pub mdns_enabled: bool,
    /// Largest message gossipsub will accept or publish.
    pub max_transmit_size: usize,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            mdns_enabled: true,
            max_transmit_size: 256 * 1024,
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

impl MeshBehaviour {
    pub fn new(key: &identity::Keypair, config: &BehaviourConfig) -> Result<Self, NetworkError> {
        let gossip_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(config.heartbeat_interval)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(config.max_transmit_size)
            .build()
            .map_err(|e| NetworkError::Behaviour(format!("gossipsub config: {e}")))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(key.clone()),
            gossip_config,
        )
        .map_err(|e| NetworkError::Behaviour(format!("gossipsub init: {e}")))?;

        let mdns = if config.mdns_enabled {
            let behaviour =
                mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())
                    .map_err(|e| NetworkError::Behaviour(format!("mdns init: {e}")))?;
            Some(behaviour)
        } else {
            None
        };

        Ok(Self {
            gossipsub,
            mdns: Toggle::from(mdns),
        })
    }
}
