use std::collections::BTreeSet;

use agentmesh_protocol::*;
use serde_json::json;

fn envelope(kind: MessageType, payload: Payload, target: Option<&str>) -> MessageEnvelope {
    MessageEnvelope::new(kind, AgentId::from("sender"), target.map(AgentId::from), payload)
        .unwrap()
}

fn one_of_each() -> Vec<MessageEnvelope> {
    let caps = AgentCapabilities::new(AgentId::from("sender"))
        .with_capabilities(["python", "ml"])
        .with_specializations(["nlp"])
        .with_description("test agent")
        .with_version("0.3.1")
        .with_message_types(MessageType::KNOWN)
        .with_status(AgentStatus::Busy);

    let mut details = serde_json::Map::new();
    details.insert("deadline_secs".into(), json!(120));

    vec![
        envelope(MessageType::CapabilityAnnounce, Payload::CapabilityAnnounce(caps), None),
        envelope(
            MessageType::CapabilityWithdraw,
            Payload::CapabilityWithdraw(WithdrawParams {
                agent_id: AgentId::from("sender"),
                reason: Some("shutdown".into()),
            }),
            None,
        ),
        envelope(
            MessageType::SimpleMessage,
            Payload::SimpleMessage(SimpleMessageParams { content: "ping".into() }),
            Some("peer"),
        ),
        envelope(
            MessageType::TechnicalExchange,
            Payload::TechnicalExchange(TechnicalExchangeParams {
                topic: "indexing".into(),
                content: "use a btree".into(),
                references: vec!["doc://btree".into()],
            }),
            Some("peer"),
        ),
        envelope(
            MessageType::HelpWanted,
            Payload::HelpWanted(HelpWantedParams {
                description: "review a patch".into(),
                required_capabilities: BTreeSet::from(["rust".to_string()]),
                details,
            }),
            None,
        ),
        envelope(
            MessageType::AgentResponse,
            Payload::AgentResponse(AgentResponseParams {
                in_reply_to: Some("abc".into()),
                success: false,
                content: "cannot help".into(),
                data: Some(json!({"retry_after": 5})),
            }),
            Some("peer"),
        ),
        envelope(
            MessageType::StatusUpdate,
            Payload::StatusUpdate(StatusUpdateParams {
                status: AgentStatus::Idle,
                detail: None,
            }),
            None,
        ),
    ]
}

#[test]
fn test_every_known_type_roundtrips() {
    for env in one_of_each() {
        let bytes = encode(&env).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, env, "roundtrip failed for {}", env.kind);
    }
}

#[test]
fn test_every_known_type_is_covered() {
    let kinds: BTreeSet<MessageType> = one_of_each().into_iter().map(|e| e.kind).collect();
    let known: BTreeSet<MessageType> = MessageType::KNOWN.into_iter().collect();
    assert_eq!(kinds, known);
}

#[test]
fn test_foreign_envelope_with_unknown_type_is_accepted() {
    let raw = json!({
        "id": "5a1c7e2e-0000-4000-8000-000000000001",
        "type": "consensus_vote",
        "source": "remote-agent",
        "target": null,
        "payload": {"round": 3, "choice": "b"},
        "timestamp": "2025-01-02T03:04:05.678Z",
        "priority": 4
    });
    let env = decode(&serde_json::to_vec(&raw).unwrap()).unwrap();
    assert_eq!(env.kind.as_str(), "consensus_vote");
    assert!(env.is_broadcast());
    match &env.payload {
        Payload::Extension(map) => assert_eq!(map["round"], json!(3)),
        other => panic!("expected extension payload, got {other:?}"),
    }

    // Re-encoding keeps the unknown tag and body intact.
    let again = decode(&encode(&env).unwrap()).unwrap();
    assert_eq!(again, env);
}

#[test]
fn test_typed_payload_shape_errors_name_payload() {
    let raw = json!({
        "id": "m-9",
        "type": "help_wanted",
        "source": "remote-agent",
        "payload": {"required_capabilities": ["rust"]},
        "timestamp": "2025-01-02T03:04:05Z"
    });
    let err = decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
    assert_eq!(err.field(), Some("payload"));
}
