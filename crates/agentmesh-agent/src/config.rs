//! Agent configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file) is a
//! valid configuration:
//!
//! ```toml
//! [agent]
//! id = "reviewer-1"
//! capabilities = ["python", "code_review"]
//!
//! [transport]
//! listen_addr = "/ip4/0.0.0.0/tcp/4001"
//! bootstrap_peers = ["/ip4/10.0.0.2/tcp/4001"]
//!
//! [discovery]
//! announce_interval_secs = 30
//! registry_ttl_secs = 90
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentmesh_network::{BehaviourConfig, ConnectionConfig, GossipConfig};
use agentmesh_protocol::{
    AgentCapabilities, AgentId, MessageType, DEFAULT_ANNOUNCE_INTERVAL_SECS,
    DEFAULT_BROADCAST_CHANNEL, DEFAULT_EVICTION_INTERVAL_SECS, DEFAULT_INTERACTION_WINDOW,
    DEFAULT_OUTBOUND_BUFFER, DEFAULT_REGISTRY_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub transport: TransportSection,
    pub discovery: DiscoverySection,
    pub interactions: InteractionSection,
    pub storage: StorageSection,
    pub runtime: RuntimeSection,
}

/// Identity and advertised capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Generated as `agent-<8 hex>` when absent.
    pub id: Option<String>,
    pub description: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub specializations: Vec<String>,
    /// Message types this agent consumes. Defaults to every known type.
    pub supported_message_types: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            description: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Vec::new(),
            specializations: Vec::new(),
            supported_message_types: MessageType::KNOWN
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Gossip,
    /// In-process bus; the transport must be supplied by the embedding code.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub kind: TransportKind,
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    pub mdns: bool,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Outbound messages held while disconnected.
    pub buffer_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: TransportKind::Gossip,
            listen_addr: "/ip4/0.0.0.0/tcp/0".to_string(),
            bootstrap_peers: Vec::new(),
            mdns: true,
            connect_attempts: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            buffer_capacity: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub broadcast_channel: String,
    pub announce_interval_secs: u64,
    pub registry_ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            broadcast_channel: DEFAULT_BROADCAST_CHANNEL.to_string(),
            announce_interval_secs: DEFAULT_ANNOUNCE_INTERVAL_SECS,
            registry_ttl_secs: DEFAULT_REGISTRY_TTL_SECS,
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionSection {
    /// Records kept per peer.
    pub window: usize,
}

impl Default for InteractionSection {
    fn default() -> Self {
        Self {
            window: DEFAULT_INTERACTION_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Primary SQLite database. Defaults to `<data dir>/agentmesh/<agent id>/messages.db`.
    pub primary_path: Option<PathBuf>,
    /// Embedded fallback database. Defaults to `<data dir>/agentmesh/<agent id>/fallback.db`.
    pub fallback_path: Option<PathBuf>,
}

impl StorageSection {
    pub fn primary_path_for(&self, agent_id: &AgentId) -> PathBuf {
        self.primary_path
            .clone()
            .unwrap_or_else(|| default_data_dir(agent_id).join("messages.db"))
    }

    pub fn fallback_path_for(&self, agent_id: &AgentId) -> PathBuf {
        self.fallback_path
            .clone()
            .unwrap_or_else(|| default_data_dir(agent_id).join("fallback.db"))
    }
}

fn default_data_dir(agent_id: &AgentId) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agentmesh")
        .join(agent_id.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Bound on handler-deferred work waiting to run.
    pub work_queue_capacity: usize,
    /// Total time shutdown may spend draining work and writes.
    pub shutdown_grace_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            work_queue_capacity: 64,
            shutdown_grace_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if let Some(id) = &self.agent.id {
            if id.trim().is_empty() {
                return invalid("agent.id must not be blank");
            }
        }
        let d = &self.discovery;
        if d.broadcast_channel.trim().is_empty() {
            return invalid("discovery.broadcast_channel must not be blank");
        }
        if d.announce_interval_secs == 0 || d.eviction_interval_secs == 0 {
            return invalid("discovery intervals must be greater than zero");
        }
        if d.registry_ttl_secs < d.announce_interval_secs {
            return invalid("discovery.registry_ttl_secs must be at least the announce interval");
        }
        let t = &self.transport;
        if t.connect_attempts == 0 {
            return invalid("transport.connect_attempts must be greater than zero");
        }
        if t.backoff_base_ms == 0 || t.backoff_max_ms < t.backoff_base_ms {
            return invalid("transport backoff must satisfy 0 < base <= max");
        }
        if t.buffer_capacity == 0 {
            return invalid("transport.buffer_capacity must be greater than zero");
        }
        if self.interactions.window == 0 {
            return invalid("interactions.window must be greater than zero");
        }
        if self.runtime.work_queue_capacity == 0 {
            return invalid("runtime.work_queue_capacity must be greater than zero");
        }
        if self.runtime.request_timeout_ms == 0 {
            return invalid("runtime.request_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// The configured agent id, generating and remembering one if absent.
    pub fn ensure_agent_id(&mut self) -> AgentId {
        match &self.agent.id {
            Some(id) => AgentId::new(id.trim()),
            None => {
                let id = AgentId::generate();
                self.agent.id = Some(id.to_string());
                id
            }
        }
    }

    /// The advertisement this agent announces.
    pub fn capabilities(&self, agent_id: &AgentId) -> AgentCapabilities {
        AgentCapabilities::new(agent_id.clone())
            .with_capabilities(self.agent.capabilities.iter().cloned())
            .with_specializations(self.agent.specializations.iter().cloned())
            .with_description(self.agent.description.clone())
            .with_version(self.agent.version.clone())
            .with_message_types(
                self.agent
                    .supported_message_types
                    .iter()
                    .map(|tag| MessageType::parse(tag)),
            )
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_attempts: self.transport.connect_attempts,
            backoff_base: Duration::from_millis(self.transport.backoff_base_ms),
            backoff_max: Duration::from_millis(self.transport.backoff_max_ms),
            buffer_capacity: self.transport.buffer_capacity,
            ..ConnectionConfig::default()
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            listen_addr: self.transport.listen_addr.clone(),
            bootstrap_peers: self.transport.bootstrap_peers.clone(),
            behaviour: BehaviourConfig {
                mdns_enabled: self.transport.mdns,
                ..BehaviourConfig::default()
            },
            ..GossipConfig::default()
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.announce_interval_secs)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery.registry_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.eviction_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.runtime.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.request_timeout_ms)
    }
}
