//! Several agents sharing one in-process bus.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_agent::{
    AgentConfig, AgentRuntime, DiscoveryFilter, DiscoveryState, HandlerContext, RouterError,
    RuntimeError, TransportKind,
};
use agentmesh_network::{MemoryBus, Transport};
use agentmesh_protocol::{
    codec, AgentId, AgentResponseParams, HelpWantedParams, MessageEnvelope, MessageType, Payload,
    SimpleMessageParams, DEFAULT_BROADCAST_CHANNEL, DEFAULT_PRIORITY,
};
use agentmesh_store::{MemoryStore, PersistenceLayer, StorageBackend, StorageStatus};

fn config(id: &str, capabilities: &[&str]) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.id = Some(id.to_string());
    config.agent.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
    config.transport.kind = TransportKind::Memory;
    config.transport.backoff_base_ms = 10;
    config.transport.backoff_max_ms = 50;
    config.runtime.shutdown_grace_ms = 1_000;
    config
}

fn memory_persistence() -> Arc<PersistenceLayer> {
    Arc::new(PersistenceLayer::new(
        Arc::new(MemoryStore::named("primary")),
        Arc::new(MemoryStore::named("fallback")),
    ))
}

async fn start(bus: &Arc<MemoryBus>, id: &str, capabilities: &[&str]) -> AgentRuntime {
    AgentRuntime::builder(config(id, capabilities))
        .transport(Arc::new(bus.transport()))
        .persistence(memory_persistence())
        .start()
        .await
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn simple(content: &str) -> Payload {
    Payload::SimpleMessage(SimpleMessageParams {
        content: content.to_string(),
    })
}

fn counting_handler(
    counter: Arc<AtomicUsize>,
) -> impl Fn(&MessageEnvelope, &HandlerContext) -> anyhow::Result<()> + Send + Sync + 'static {
    move |_: &MessageEnvelope, _: &HandlerContext| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn start_counting(bus: &Arc<MemoryBus>, id: &str, counter: Arc<AtomicUsize>) -> AgentRuntime {
    AgentRuntime::builder(config(id, &[]))
        .transport(Arc::new(bus.transport()))
        .persistence(memory_persistence())
        .handler(MessageType::SimpleMessage, counting_handler(counter))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_broadcast_reaches_everyone_but_the_sender() {
    let bus = MemoryBus::new();
    let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let a = start_counting(&bus, "a", counts[0].clone()).await;
    let _b = start_counting(&bus, "b", counts[1].clone()).await;
    let _c = start_counting(&bus, "c", counts[2].clone()).await;

    a.send(MessageType::SimpleMessage, None, simple("hello"), DEFAULT_PRIORITY)
        .await
        .unwrap();

    wait_until(|| {
        let counts = counts.clone();
        async move { counts[1].load(Ordering::SeqCst) == 1 && counts[2].load(Ordering::SeqCst) == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counts[0].load(Ordering::SeqCst), 0);
    assert!(a.health().await.router.self_echoes >= 1);
}

#[tokio::test]
async fn test_ranking_follows_injected_success_rates() {
    let bus = MemoryBus::new();
    let observer = start(&bus, "observer", &[]).await;
    let _a = start(&bus, "agent-a", &["python", "ml"]).await;
    let _b = start(&bus, "agent-b", &["python"]).await;

    let view = &observer;
    wait_until(|| async move { view.find_best_agents(["python"], Some(2)).await.len() == 2 }).await;

    let a = AgentId::from("agent-a");
    let b = AgentId::from("agent-b");
    observer.record_interaction(&a, true, Duration::from_millis(5)).await;
    observer.record_interaction(&a, false, Duration::from_millis(5)).await;
    observer.record_interaction(&b, true, Duration::from_millis(5)).await;
    assert_eq!(observer.find_best_agents(["python"], Some(2)).await, vec![b.clone(), a.clone()]);

    // Two required tags: agent-a matches both and wins regardless of history.
    assert_eq!(
        observer.find_best_agents(["python", "ml"], None).await,
        vec![a.clone(), b.clone()]
    );

    let ml = observer
        .discover_agents(&DiscoveryFilter::default().with_capability("ml"))
        .await;
    assert_eq!(ml.len(), 1);
    assert_eq!(ml[0].agent_id(), &a);
}

#[tokio::test]
async fn test_unreachable_primary_degrades_to_fallback() {
    let bus = MemoryBus::new();
    let primary = Arc::new(MemoryStore::named("primary"));
    let persistence = Arc::new(PersistenceLayer::new(
        primary.clone(),
        Arc::new(MemoryStore::named("fallback")),
    ));
    let agent = AgentRuntime::builder(config("solo", &[]))
        .transport(Arc::new(bus.transport()))
        .persistence(persistence.clone())
        .start()
        .await
        .unwrap();

    primary.set_available(false);
    agent
        .send(MessageType::SimpleMessage, None, simple("during outage"), DEFAULT_PRIORITY)
        .await
        .unwrap();
    assert_eq!(persistence.last_backend(), StorageBackend::Fallback);
    let health = agent.health().await;
    assert_eq!(health.storage.storage_backend, StorageBackend::Fallback);
    assert_eq!(health.storage.status, StorageStatus::Degraded);

    primary.set_available(true);
    agent
        .send(MessageType::SimpleMessage, None, simple("recovered"), DEFAULT_PRIORITY)
        .await
        .unwrap();
    assert_eq!(persistence.last_backend(), StorageBackend::Primary);
    assert_eq!(agent.health().await.storage.storage_backend, StorageBackend::Primary);
}

#[tokio::test]
async fn test_duplicate_envelope_is_dispatched_and_counted_once() {
    let bus = MemoryBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    let receiver = start_counting(&bus, "receiver", count.clone()).await;

    let raw = bus.transport();
    raw.connect().await.unwrap();
    let envelope = MessageEnvelope::new(
        MessageType::SimpleMessage,
        AgentId::from("replayer"),
        None,
        simple("twice"),
    )
    .unwrap();
    let bytes = codec::encode(&envelope).unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, bytes.clone()).await.unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, bytes).await.unwrap();

    let view = &receiver;
    wait_until(|| async move { view.health().await.router.duplicates == 1 }).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let stats = receiver.network_stats(Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.message_counts.get("simple_message"), Some(&1));
    assert_eq!(stats.discovery_manager, AgentId::from("receiver"));
    // The replayer was discovered from its traffic alone.
    assert_eq!(stats.total_agents, 1);
}

#[tokio::test]
async fn test_malformed_bytes_are_dropped_and_counted() {
    let bus = MemoryBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    let receiver = start_counting(&bus, "receiver", count.clone()).await;

    let raw = bus.transport();
    raw.connect().await.unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, b"{not json".to_vec())
        .await
        .unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, br#"{"type":"simple_message"}"#.to_vec())
        .await
        .unwrap();
    let good = MessageEnvelope::new(
        MessageType::SimpleMessage,
        AgentId::from("sender"),
        None,
        simple("still flowing"),
    )
    .unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, codec::encode(&good).unwrap())
        .await
        .unwrap();

    wait_until(|| {
        let count = count.clone();
        async move { count.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert_eq!(receiver.health().await.router.decode_errors, 2);
}

#[tokio::test]
async fn test_request_receives_correlated_response() {
    let bus = MemoryBus::new();
    let _responder = AgentRuntime::builder(config("responder", &["rust"]))
        .transport(Arc::new(bus.transport()))
        .persistence(memory_persistence())
        .handler(
            MessageType::HelpWanted,
            |envelope: &MessageEnvelope, ctx: &HandlerContext| -> anyhow::Result<()> {
                ctx.reply(envelope, AgentResponseParams::reply_to(envelope, "on it"))?;
                Ok(())
            },
        )
        .start()
        .await
        .unwrap();
    let requester = start(&bus, "requester", &[]).await;

    let responder_id = AgentId::from("responder");
    let response = requester
        .request_with_timeout(
            MessageType::HelpWanted,
            Some(responder_id.clone()),
            Payload::HelpWanted(HelpWantedParams {
                description: "review a patch".into(),
                required_capabilities: ["rust".to_string()].into(),
                details: Default::default(),
            }),
            DEFAULT_PRIORITY,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(response.source, responder_id);
    match &response.payload {
        Payload::AgentResponse(params) => {
            assert!(params.success);
            assert_eq!(params.content, "on it");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    let summary = requester.interaction_summary(&responder_id).await;
    assert_eq!(summary.sample_count, 1);
    assert_eq!(summary.success_rate, 1.0);
    assert_eq!(requester.health().await.router.responses_matched, 1);
}

#[tokio::test]
async fn test_request_timeout_counts_as_failed_interaction() {
    let bus = MemoryBus::new();
    let requester = start(&bus, "requester", &[]).await;
    let ghost = AgentId::from("ghost");

    let err = requester
        .request_with_timeout(
            MessageType::SimpleMessage,
            Some(ghost.clone()),
            simple("anyone?"),
            DEFAULT_PRIORITY,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Router(RouterError::Timeout { .. })
    ));

    let summary = requester.interaction_summary(&ghost).await;
    assert_eq!(summary.sample_count, 1);
    assert_eq!(summary.success_rate, 0.0);
}

#[tokio::test]
async fn test_failing_handlers_do_not_stop_dispatch() {
    let bus = MemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let receiver = AgentRuntime::builder(config("receiver", &[]))
        .transport(Arc::new(bus.transport()))
        .persistence(memory_persistence())
        .handler(
            MessageType::SimpleMessage,
            move |envelope: &MessageEnvelope, _: &HandlerContext| -> anyhow::Result<()> {
                match &envelope.payload {
                    Payload::SimpleMessage(m) if m.content == "fail" => anyhow::bail!("refused"),
                    Payload::SimpleMessage(m) if m.content == "panic" => panic!("handler bug"),
                    _ => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            },
        )
        .start()
        .await
        .unwrap();
    let sender = start(&bus, "sender", &[]).await;

    let target = Some(AgentId::from("receiver"));
    for content in ["fail", "panic", "ok"] {
        sender
            .send(MessageType::SimpleMessage, target.clone(), simple(content), DEFAULT_PRIORITY)
            .await
            .unwrap();
    }

    wait_until(|| {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
    let router = receiver.health().await.router;
    assert_eq!(router.handler_errors, 1);
    assert_eq!(router.handler_panics, 1);
}

#[tokio::test]
async fn test_unknown_types_reach_the_default_handler() {
    let bus = MemoryBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let receiver = AgentRuntime::builder(config("receiver", &[]))
        .transport(Arc::new(bus.transport()))
        .persistence(memory_persistence())
        .default_handler(counting_handler(seen.clone()))
        .start()
        .await
        .unwrap();
    let sender = start(&bus, "sender", &[]).await;

    let mut fields = serde_json::Map::new();
    fields.insert("note".into(), serde_json::json!("from the future"));
    sender
        .send(
            MessageType::parse("x_vendor_event"),
            None,
            Payload::Extension(fields),
            DEFAULT_PRIORITY,
        )
        .await
        .unwrap();

    wait_until(|| {
        let seen = seen.clone();
        async move { seen.load(Ordering::SeqCst) == 1 }
    })
    .await;
    let recent = receiver
        .recent_messages(10, Some(&AgentId::from("sender")))
        .await
        .unwrap();
    assert!(recent.iter().any(|e| e.kind.as_str() == "x_vendor_event"));
}

#[tokio::test]
async fn test_messages_for_other_agents_are_not_dispatched() {
    let bus = MemoryBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    let bystander = start_counting(&bus, "bystander", count.clone()).await;

    // Broadcast channel, but addressed to someone else.
    let mut envelope = MessageEnvelope::new(
        MessageType::SimpleMessage,
        AgentId::from("sender"),
        None,
        simple("not for you"),
    )
    .unwrap();
    envelope.target = Some(AgentId::from("elsewhere"));
    let raw = bus.transport();
    raw.connect().await.unwrap();
    raw.publish(DEFAULT_BROADCAST_CHANNEL, codec::encode(&envelope).unwrap())
        .await
        .unwrap();

    let view = &bystander;
    wait_until(|| async move { view.health().await.router.not_addressed == 1 }).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_status_update_changes_registry_view() {
    let bus = MemoryBus::new();
    let observer = start(&bus, "observer", &[]).await;
    let worker = start(&bus, "worker", &["python"]).await;

    let busy = DiscoveryFilter::default().with_status(agentmesh_protocol::AgentStatus::Busy);
    worker
        .set_status(agentmesh_protocol::AgentStatus::Busy, Some("training".into()))
        .await
        .unwrap();
    let (view, filter) = (&observer, &busy);
    wait_until(|| async move { view.discover_agents(filter).await.len() == 1 }).await;

    let stats = observer.network_stats(Duration::from_secs(60)).await.unwrap();
    assert_eq!(stats.busy_agents, 1);
}

#[tokio::test]
async fn test_shutdown_withdraws_from_peers() {
    let bus = MemoryBus::new();
    let observer = start(&bus, "observer", &[]).await;
    let leaving = start(&bus, "leaving", &["ml"]).await;

    let ml = DiscoveryFilter::default().with_capability("ml");
    let (view, filter) = (&observer, &ml);
    wait_until(|| async move { view.discover_agents(filter).await.len() == 1 }).await;

    let report = leaving.shutdown().await.unwrap();
    assert!(report.withdrawn);
    assert_eq!(report.abandoned_work, 0);
    assert_eq!(report.abandoned_writes, 0);

    wait_until(|| async move { view.discover_agents(filter).await.is_empty() }).await;
    assert!(matches!(
        leaving
            .send(MessageType::SimpleMessage, None, simple("late"), DEFAULT_PRIORITY)
            .await,
        Err(RuntimeError::ShutDown)
    ));
    assert!(matches!(leaving.shutdown().await, Err(RuntimeError::ShutDown)));

    let health = observer.health().await;
    assert_eq!(health.discovery, DiscoveryState::Active);
    assert_eq!(health.known_agents, 1);
    assert_eq!(health.active_agents, 0);
}

#[tokio::test]
async fn test_shutdown_while_offline_does_not_claim_withdrawal() {
    let bus = MemoryBus::new();
    let agent = start(&bus, "stranded", &["ml"]).await;

    bus.set_online(false).await;
    let report = agent.shutdown().await.unwrap();
    assert!(!report.withdrawn);
    assert!(report.abandoned_buffered >= 1);
}

#[tokio::test]
async fn test_default_persistence_uses_configured_sqlite_files() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MemoryBus::new();
    let mut config = config("archivist", &["storage"]);
    config.storage.primary_path = Some(dir.path().join("primary").join("messages.db"));
    config.storage.fallback_path = Some(dir.path().join("fallback").join("messages.db"));
    let agent = AgentRuntime::builder(config)
        .transport(Arc::new(bus.transport()))
        .start()
        .await
        .unwrap();

    // The primary directory does not exist, so writes land in the fallback.
    agent
        .send(MessageType::SimpleMessage, None, simple("logged"), DEFAULT_PRIORITY)
        .await
        .unwrap();
    let health = agent.health().await;
    assert_eq!(health.storage.storage_backend, StorageBackend::Fallback);
    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["storage"]["storage_backend"], "fallback");
    assert_eq!(json["discovery"], "active");

    let recent = agent.recent_messages(10, None).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].kind, MessageType::SimpleMessage);
    assert_eq!(recent[1].kind, MessageType::CapabilityAnnounce);

    agent.shutdown().await.unwrap();
}
