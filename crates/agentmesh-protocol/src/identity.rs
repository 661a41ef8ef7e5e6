use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MessageType;

/// Stable identifier of an agent for the lifetime of its process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id of the form `agent-<8 hex chars>`.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("agent-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Availability advertised by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and advertised abilities of one agent.
///
/// This is both the `capability_announce` payload and the capability half of a
/// registry entry. Tag sets are ordered so that serialization and ranking are
/// reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub agent_id: AgentId,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub supported_message_types: BTreeSet<MessageType>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl AgentCapabilities {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            capabilities: BTreeSet::new(),
            specializations: BTreeSet::new(),
            description: String::new(),
            version: String::new(),
            supported_message_types: BTreeSet::new(),
            status: AgentStatus::Idle,
            last_seen: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_specializations<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specializations.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_message_types<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = MessageType>,
    {
        self.supported_message_types.extend(kinds);
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = at;
        self
    }

    /// True if `tag` is advertised as a capability or a specialization.
    pub fn advertises(&self, tag: &str) -> bool {
        self.capabilities.contains(tag) || self.specializations.contains(tag)
    }

    /// Size of the intersection between `required` and capabilities ∪ specializations.
    pub fn match_count<'a, I>(&self, required: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().filter(|tag| self.advertises(tag)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("agent-"));
        assert_eq!(a.as_str().len(), "agent-".len() + 8);
    }

    #[test]
    fn test_match_count_uses_union_of_tags() {
        let caps = AgentCapabilities::new(AgentId::from("a"))
            .with_capabilities(["python", "ml"])
            .with_specializations(["pytorch", "python"]);

        let required: BTreeSet<String> =
            ["python", "pytorch", "rust"].iter().map(|s| s.to_string()).collect();
        assert_eq!(caps.match_count(&required), 2);
        assert!(caps.advertises("pytorch"));
        assert!(!caps.advertises("rust"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&AgentStatus::Busy).unwrap();
        assert_eq!(json, "\"busy\"");
        let parsed: AgentStatus = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(parsed, AgentStatus::Offline);
    }

    #[test]
    fn test_announcement_defaults_missing_fields() {
        let caps: AgentCapabilities =
            serde_json::from_str(r#"{"agent_id":"solo","capabilities":["rust"]}"#).unwrap();
        assert_eq!(caps.agent_id.as_str(), "solo");
        assert_eq!(caps.status, AgentStatus::Idle);
        assert!(caps.specializations.is_empty());
        assert!(caps.advertises("rust"));
    }
}
