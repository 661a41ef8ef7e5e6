use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    DEFAULT_BROADCAST_CHANNEL, DEFAULT_PRIORITY, DIRECT_CHANNEL_PREFIX, DIRECT_CHANNEL_SUFFIX,
    MAX_PRIORITY, MIN_PRIORITY,
};
use crate::error::{DecodeError, ProtocolError};
use crate::identity::{AgentCapabilities, AgentId, AgentStatus};
use crate::types::MessageType;

/// The unit of exchange between agents.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Globally unique id; the persistence layer deduplicates on it.
    pub id: String,
    pub kind: MessageType,
    pub source: AgentId,
    /// `None` means broadcast to every subscriber.
    pub target: Option<AgentId>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// 1 is the most urgent. A hint for local scheduling, never enforced.
    pub priority: u8,
}

impl MessageEnvelope {
    /// Build a fresh envelope with a new id and the current time.
    ///
    /// Fails if `payload` is a typed variant belonging to another message type,
    /// or if an extension payload is used with a known type.
    pub fn new(
        kind: MessageType,
        source: AgentId,
        target: Option<AgentId>,
        payload: Payload,
    ) -> Result<Self, ProtocolError> {
        if source.is_empty() {
            return Err(ProtocolError::InvalidAgentId("source must not be empty".into()));
        }
        let consistent = match payload.kind() {
            Some(payload_kind) => payload_kind == kind,
            None => !kind.is_known(),
        };
        if !consistent {
            return Err(ProtocolError::PayloadMismatch {
                kind: kind.to_string(),
            });
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            target,
            payload,
            timestamp: Utc::now(),
            priority: DEFAULT_PRIORITY,
        })
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(i64::from(priority));
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// True for broadcasts and for envelopes targeted at `agent_id`.
    pub fn is_addressed_to(&self, agent_id: &AgentId) -> bool {
        self.target.as_ref().map_or(true, |target| target == agent_id)
    }
}

pub(crate) fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(i64::from(MIN_PRIORITY), i64::from(MAX_PRIORITY)) as u8
}

// ── Payloads ──

/// Typed payload, keyed by the envelope's message type.
///
/// Known types carry validated params; anything else is kept verbatim in
/// `Extension` so it can be persisted and handed to the default handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    CapabilityAnnounce(AgentCapabilities),
    CapabilityWithdraw(WithdrawParams),
    SimpleMessage(SimpleMessageParams),
    TechnicalExchange(TechnicalExchangeParams),
    HelpWanted(HelpWantedParams),
    AgentResponse(AgentResponseParams),
    StatusUpdate(StatusUpdateParams),
    Extension(Map<String, Value>),
}

impl Payload {
    /// The message type this payload belongs to; `None` for extensions.
    pub fn kind(&self) -> Option<MessageType> {
        let kind = match self {
            Self::CapabilityAnnounce(_) => MessageType::CapabilityAnnounce,
            Self::CapabilityWithdraw(_) => MessageType::CapabilityWithdraw,
            Self::SimpleMessage(_) => MessageType::SimpleMessage,
            Self::TechnicalExchange(_) => MessageType::TechnicalExchange,
            Self::HelpWanted(_) => MessageType::HelpWanted,
            Self::AgentResponse(_) => MessageType::AgentResponse,
            Self::StatusUpdate(_) => MessageType::StatusUpdate,
            Self::Extension(_) => return None,
        };
        Some(kind)
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Self::CapabilityAnnounce(p) => serde_json::to_value(p),
            Self::CapabilityWithdraw(p) => serde_json::to_value(p),
            Self::SimpleMessage(p) => serde_json::to_value(p),
            Self::TechnicalExchange(p) => serde_json::to_value(p),
            Self::HelpWanted(p) => serde_json::to_value(p),
            Self::AgentResponse(p) => serde_json::to_value(p),
            Self::StatusUpdate(p) => serde_json::to_value(p),
            Self::Extension(map) => return Ok(Value::Object(map.clone())),
        };
        value.map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Interpret a payload object according to `kind`.
    pub fn from_value(kind: &MessageType, value: Value) -> Result<Self, DecodeError> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "payload",
                    reason: format!("expected a JSON object, got {}", json_kind(&other)),
                })
            }
        };
        let value = Value::Object(map);
        let payload = match kind {
            MessageType::CapabilityAnnounce => Self::CapabilityAnnounce(typed(value)?),
            MessageType::CapabilityWithdraw => Self::CapabilityWithdraw(typed(value)?),
            MessageType::SimpleMessage => Self::SimpleMessage(typed(value)?),
            MessageType::TechnicalExchange => Self::TechnicalExchange(typed(value)?),
            MessageType::HelpWanted => Self::HelpWanted(typed(value)?),
            MessageType::AgentResponse => Self::AgentResponse(typed(value)?),
            MessageType::StatusUpdate => Self::StatusUpdate(typed(value)?),
            MessageType::Other(_) => match value {
                Value::Object(map) => Self::Extension(map),
                _ => Self::Extension(Map::new()),
            },
        };
        Ok(payload)
    }
}

fn typed<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidField {
        field: "payload",
        reason: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Departure notice published on a best-effort basis when an agent stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawParams {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMessageParams {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalExchangeParams {
    pub topic: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// Request for assistance. The body's meaning belongs to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpWantedParams {
    pub description: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponseParams {
    /// Id of the envelope this answers, used for request correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl AgentResponseParams {
    pub fn reply_to(envelope: &MessageEnvelope, content: impl Into<String>) -> Self {
        Self {
            in_reply_to: Some(envelope.id.clone()),
            success: true,
            content: content.into(),
            data: None,
        }
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateParams {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ── Channels ──

/// Pub/sub channel names used by the protocol.
pub struct Channels;

impl Channels {
    /// Shared broadcast channel name used when none is configured.
    pub fn broadcast_default() -> String {
        DEFAULT_BROADCAST_CHANNEL.to_string()
    }

    /// Per-agent channel for targeted delivery: `agent:<agent_id>:direct`.
    pub fn direct(agent_id: &AgentId) -> String {
        format!("{DIRECT_CHANNEL_PREFIX}{agent_id}{DIRECT_CHANNEL_SUFFIX}")
    }

    /// Inverse of [`Channels::direct`].
    pub fn direct_owner(channel: &str) -> Option<AgentId> {
        channel
            .strip_prefix(DIRECT_CHANNEL_PREFIX)
            .and_then(|rest| rest.strip_suffix(DIRECT_CHANNEL_SUFFIX))
            .filter(|id| !id.is_empty())
            .map(AgentId::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::from(id)
    }

    #[test]
    fn test_new_envelope_defaults() {
        let env = MessageEnvelope::new(
            MessageType::SimpleMessage,
            agent("alice"),
            None,
            Payload::SimpleMessage(SimpleMessageParams { content: "hi".into() }),
        )
        .unwrap();
        assert_eq!(env.priority, DEFAULT_PRIORITY);
        assert!(env.is_broadcast());
        assert!(env.is_addressed_to(&agent("anyone")));
        assert!(uuid::Uuid::parse_str(&env.id).is_ok());
    }

    #[test]
    fn test_payload_kind_mismatch_rejected() {
        let err = MessageEnvelope::new(
            MessageType::HelpWanted,
            agent("alice"),
            None,
            Payload::SimpleMessage(SimpleMessageParams { content: "hi".into() }),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_extension_payload_requires_unknown_type() {
        assert!(MessageEnvelope::new(
            MessageType::SimpleMessage,
            agent("alice"),
            None,
            Payload::Extension(Map::new()),
        )
        .is_err());

        assert!(MessageEnvelope::new(
            MessageType::Other("vote".into()),
            agent("alice"),
            None,
            Payload::Extension(Map::new()),
        )
        .is_ok());
    }

    #[test]
    fn test_priority_is_clamped() {
        let env = MessageEnvelope::new(
            MessageType::SimpleMessage,
            agent("alice"),
            Some(agent("bob")),
            Payload::SimpleMessage(SimpleMessageParams { content: "x".into() }),
        )
        .unwrap();
        assert_eq!(env.clone().with_priority(0).priority, MIN_PRIORITY);
        assert_eq!(env.clone().with_priority(42).priority, MAX_PRIORITY);
        assert_eq!(env.with_priority(1).priority, 1);
    }

    #[test]
    fn test_targeted_envelope_addressing() {
        let env = MessageEnvelope::new(
            MessageType::SimpleMessage,
            agent("alice"),
            Some(agent("bob")),
            Payload::SimpleMessage(SimpleMessageParams { content: "x".into() }),
        )
        .unwrap();
        assert!(env.is_addressed_to(&agent("bob")));
        assert!(!env.is_addressed_to(&agent("carol")));
    }

    #[test]
    fn test_known_payload_validated() {
        let err = Payload::from_value(
            &MessageType::StatusUpdate,
            serde_json::json!({"status": "sleeping"}),
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("payload"));

        let ok = Payload::from_value(
            &MessageType::StatusUpdate,
            serde_json::json!({"status": "busy", "detail": "indexing"}),
        )
        .unwrap();
        assert!(matches!(ok, Payload::StatusUpdate(StatusUpdateParams { status: AgentStatus::Busy, .. })));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = Payload::from_value(&MessageType::Other("x".into()), serde_json::json!([1, 2]))
            .unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_response_defaults_to_success() {
        let parsed = Payload::from_value(
            &MessageType::AgentResponse,
            serde_json::json!({"in_reply_to": "abc", "content": "done"}),
        )
        .unwrap();
        match parsed {
            Payload::AgentResponse(resp) => {
                assert!(resp.success);
                assert_eq!(resp.in_reply_to.as_deref(), Some("abc"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_direct_channel_naming() {
        let id = agent("worker-7");
        let channel = Channels::direct(&id);
        assert_eq!(channel, "agent:worker-7:direct");
        assert_eq!(Channels::direct_owner(&channel), Some(id));
        assert_eq!(Channels::direct_owner("agent_network"), None);
        assert_eq!(Channels::direct_owner("agent::direct"), None);
    }
}
