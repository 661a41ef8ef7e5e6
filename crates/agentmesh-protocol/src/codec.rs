//! Envelope codec: JSON on the wire, validated on the way in.
//!
//! Wire shape:
//! `{ "id", "type", "source", "target"|null, "payload": {..}, "timestamp": RFC 3339, "priority": 1..10 }`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_PRIORITY;
use crate::error::{DecodeError, ProtocolError};
use crate::identity::AgentId;
use crate::messages::{clamp_priority, MessageEnvelope, Payload};
use crate::types::MessageType;

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    source: &'a str,
    target: Option<&'a str>,
    payload: Value,
    timestamp: String,
    priority: u8,
}

/// Fields kept untyped so that missing or mistyped ones are reported by name.
#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    id: Value,
    #[serde(rename = "type", default)]
    kind: Value,
    #[serde(default)]
    source: Value,
    #[serde(default)]
    target: Value,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    timestamp: Value,
    #[serde(default)]
    priority: Value,
}

pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let wire = OutboundEnvelope {
        id: &envelope.id,
        kind: envelope.kind.as_str(),
        source: envelope.source.as_str(),
        target: envelope.target.as_ref().map(AgentId::as_str),
        payload: envelope.payload.to_value()?,
        timestamp: envelope.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        priority: envelope.priority,
    };
    serde_json::to_vec(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<MessageEnvelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::Malformed("envelope is not a JSON object".into()));
    }
    let wire: InboundEnvelope =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let id = required(wire.id, "id")?;
    let kind = MessageType::parse(&required(wire.kind, "type")?);
    let source = AgentId::new(required(wire.source, "source")?);
    let raw_timestamp = required(wire.timestamp, "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
        .map_err(|e| DecodeError::InvalidField {
            field: "timestamp",
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    let target = match wire.target {
        Value::Null => None,
        Value::String(t) if t.trim().is_empty() => None,
        Value::String(t) => Some(AgentId::new(t)),
        other => return Err(wrong_type("target", "a string or null", &other)),
    };
    let payload = Payload::from_value(&kind, wire.payload.unwrap_or(Value::Null))?;
    let priority = match wire.priority {
        Value::Null => DEFAULT_PRIORITY,
        Value::Number(n) => match n.as_i64() {
            Some(n) => clamp_priority(n),
            None => return Err(wrong_type("priority", "an integer", &Value::Number(n))),
        },
        other => return Err(wrong_type("priority", "an integer", &other)),
    };

    Ok(MessageEnvelope {
        id,
        kind,
        source,
        target,
        payload,
        timestamp,
        priority,
    })
}

fn required(value: Value, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v),
        Value::Null | Value::String(_) => Err(DecodeError::MissingField(field)),
        other => Err(wrong_type(field, "a string", &other)),
    }
}

fn wrong_type(field: &'static str, expected: &str, found: &Value) -> DecodeError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    DecodeError::InvalidField {
        field,
        reason: format!("expected {expected}, found {found}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AgentCapabilities;
    use crate::messages::{HelpWantedParams, SimpleMessageParams};
    use serde_json::json;

    fn sample() -> MessageEnvelope {
        MessageEnvelope::new(
            MessageType::SimpleMessage,
            AgentId::from("alice"),
            Some(AgentId::from("bob")),
            Payload::SimpleMessage(SimpleMessageParams {
                content: "hello".into(),
            }),
        )
        .unwrap()
        .with_priority(2)
    }

    #[test]
    fn test_roundtrip_preserves_envelope() {
        let env = sample();
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_roundtrip_announcement_and_extension() {
        let caps = AgentCapabilities::new(AgentId::from("alice"))
            .with_capabilities(["python", "ml"])
            .with_message_types([MessageType::HelpWanted, MessageType::Other("vote".into())]);
        let announce = MessageEnvelope::new(
            MessageType::CapabilityAnnounce,
            AgentId::from("alice"),
            None,
            Payload::CapabilityAnnounce(caps),
        )
        .unwrap();
        assert_eq!(decode(&encode(&announce).unwrap()).unwrap(), announce);

        let mut body = serde_json::Map::new();
        body.insert("ballot".into(), json!([3, 1, 2]));
        let custom = MessageEnvelope::new(
            MessageType::Other("vote".into()),
            AgentId::from("alice"),
            None,
            Payload::Extension(body),
        )
        .unwrap();
        assert_eq!(decode(&encode(&custom).unwrap()).unwrap(), custom);
    }

    #[test]
    fn test_broadcast_target_encodes_as_null() {
        let env = MessageEnvelope::new(
            MessageType::HelpWanted,
            AgentId::from("alice"),
            None,
            Payload::HelpWanted(HelpWantedParams {
                description: "need a reviewer".into(),
                required_capabilities: Default::default(),
                details: Default::default(),
            }),
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["target"], Value::Null);
        assert_eq!(value["type"], "help_wanted");
    }

    #[test]
    fn test_missing_required_fields_are_named() {
        let base = json!({
            "id": "m-1",
            "type": "simple_message",
            "source": "alice",
            "payload": {"content": "x"},
            "timestamp": "2024-05-01T12:00:00Z",
        });
        for field in ["id", "type", "source", "timestamp"] {
            let mut value = base.clone();
            value.as_object_mut().unwrap().remove(field);
            let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
            assert_eq!(err, DecodeError::MissingField(field));
        }
    }

    #[test]
    fn test_mistyped_fields_are_named() {
        let base = json!({
            "id": "m-1", "type": "simple_message", "source": "alice", "target": "bob",
            "payload": {"content": "x"}, "timestamp": "2024-05-01T12:00:00Z", "priority": 3,
        });
        for (field, bad) in [
            ("id", json!(42)),
            ("type", json!(["simple_message"])),
            ("source", json!({"name": "alice"})),
            ("target", json!(7)),
            ("timestamp", json!(1714564800)),
            ("priority", json!("high")),
        ] {
            let mut value = base.clone();
            value[field] = bad;
            let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
            assert!(
                matches!(err, DecodeError::InvalidField { field: f, .. } if f == field),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn test_empty_source_counts_as_missing() {
        let bytes = serde_json::to_vec(&json!({
            "id": "m-1", "type": "simple_message", "source": "  ",
            "payload": {"content": "x"}, "timestamp": "2024-05-01T12:00:00Z",
        }))
        .unwrap();
        assert_eq!(decode(&bytes).unwrap_err(), DecodeError::MissingField("source"));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let bytes = serde_json::to_vec(&json!({
            "id": "m-1", "type": "simple_message", "source": "alice",
            "payload": {"content": "x"}, "timestamp": "yesterday",
        }))
        .unwrap();
        assert_eq!(decode(&bytes).unwrap_err().field(), Some("timestamp"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(b"[1,2,3]"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_optional_fields_defaulted() {
        let bytes = serde_json::to_vec(&json!({
            "id": "m-2", "type": "future_thing", "source": "zed",
            "timestamp": "2024-05-01T12:00:00+02:00", "priority": 99,
        }))
        .unwrap();
        let env = decode(&bytes).unwrap();
        assert_eq!(env.kind, MessageType::Other("future_thing".into()));
        assert_eq!(env.payload, Payload::Extension(Default::default()));
        assert_eq!(env.priority, 10);
        assert!(env.target.is_none());
        assert_eq!(env.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_missing_priority_defaults() {
        let bytes = serde_json::to_vec(&json!({
            "id": "m-3", "type": "simple_message", "source": "alice",
            "payload": {"content": "x"}, "timestamp": "2024-05-01T12:00:00Z",
        }))
        .unwrap();
        assert_eq!(decode(&bytes).unwrap().priority, DEFAULT_PRIORITY);
    }
}
