use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::AgentId;

/// Message type taxonomy.
///
/// Unknown tags are preserved in `Other` so that envelopes from newer agents are
/// accepted, persisted, and routed to the default handler instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    CapabilityAnnounce,
    CapabilityWithdraw,
    SimpleMessage,
    TechnicalExchange,
    HelpWanted,
    AgentResponse,
    StatusUpdate,
    Other(String),
}

impl MessageType {
    /// The types every dispatcher must recognize.
    pub const KNOWN: [MessageType; 7] = [
        MessageType::CapabilityAnnounce,
        MessageType::CapabilityWithdraw,
        MessageType::SimpleMessage,
        MessageType::TechnicalExchange,
        MessageType::HelpWanted,
        MessageType::AgentResponse,
        MessageType::StatusUpdate,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::CapabilityAnnounce => "capability_announce",
            Self::CapabilityWithdraw => "capability_withdraw",
            Self::SimpleMessage => "simple_message",
            Self::TechnicalExchange => "technical_exchange",
            Self::HelpWanted => "help_wanted",
            Self::AgentResponse => "agent_response",
            Self::StatusUpdate => "status_update",
            Self::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "capability_announce" => Self::CapabilityAnnounce,
            "capability_withdraw" => Self::CapabilityWithdraw,
            "simple_message" => Self::SimpleMessage,
            "technical_exchange" => Self::TechnicalExchange,
            "help_wanted" => Self::HelpWanted,
            "agent_response" => Self::AgentResponse,
            "status_update" => Self::StatusUpdate,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Discovery traffic that the registry consumes directly.
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::CapabilityAnnounce | Self::CapabilityWithdraw)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        kind.as_str().to_string()
    }
}

/// Point-in-time view of the network as seen by one agent.
///
/// Computed on demand from the registry and the message log; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Agent whose discovery manager produced this snapshot.
    pub discovery_manager: AgentId,
    /// Known agents, including ones flagged offline but not yet evicted.
    pub total_agents: u64,
    pub idle_agents: u64,
    pub busy_agents: u64,
    pub offline_agents: u64,
    /// Width of the message-count window.
    pub window_secs: u64,
    /// Stored messages per type tag within the window.
    pub message_counts: BTreeMap<String, u64>,
    pub total_messages: u64,
    /// Distinct senders within the window.
    pub active_senders: u64,
    pub generated_at: DateTime<Utc>,
}
