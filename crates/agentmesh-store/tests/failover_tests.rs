//! Primary/fallback behaviour of the persistence layer over real SQLite files.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_protocol::{AgentId, MessageEnvelope, MessageType, Payload, SimpleMessageParams};
use agentmesh_store::{
    MemoryStore, MessageStore, PersistenceLayer, SqliteStore, StorageBackend, StorageStatus,
};

fn message(source: &str, content: &str) -> MessageEnvelope {
    MessageEnvelope::new(
        MessageType::SimpleMessage,
        AgentId::from(source),
        None,
        Payload::SimpleMessage(SimpleMessageParams {
            content: content.into(),
        }),
    )
    .unwrap()
}

#[tokio::test]
async fn test_unreachable_primary_falls_back_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let primary_dir = dir.path().join("primary");
    let primary = Arc::new(SqliteStore::new(primary_dir.join("messages.db")).with_name("primary"));
    let fallback = Arc::new(
        SqliteStore::open(dir.path().join("fallback").join("messages.db"))
            .unwrap()
            .with_name("fallback"),
    );
    let layer = PersistenceLayer::new(primary.clone(), fallback.clone());

    // Primary directory does not exist yet: writes land in the fallback.
    let receipt = layer.store(&message("alice", "during outage")).await.unwrap();
    assert_eq!(receipt.backend, StorageBackend::Fallback);
    assert!(receipt.inserted);

    let health = layer.health_check().await;
    assert_eq!(health.storage_backend, StorageBackend::Fallback);
    assert_eq!(health.status, StorageStatus::Degraded);
    assert_eq!(
        serde_json::to_value(&health).unwrap()["storage_backend"],
        "fallback"
    );

    // Reads are served by the fallback while the primary is down.
    assert_eq!(layer.recent(10, None).await.unwrap().len(), 1);

    std::fs::create_dir_all(&primary_dir).unwrap();
    let receipt = layer.store(&message("alice", "after recovery")).await.unwrap();
    assert_eq!(receipt.backend, StorageBackend::Primary);
    assert_eq!(layer.last_backend(), StorageBackend::Primary);
    assert_eq!(layer.health_check().await.status, StorageStatus::Healthy);

    // Backends are not reconciled.
    assert_eq!(primary.recent(10, None).await.unwrap().len(), 1);
    assert_eq!(fallback.recent(10, None).await.unwrap().len(), 1);

    let stats = layer.stats();
    assert_eq!(stats.fallback_writes, 1);
    assert_eq!(stats.stored, 2);
}

#[tokio::test]
async fn test_same_id_twice_yields_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(SqliteStore::open(dir.path().join("messages.db")).unwrap());
    let layer = PersistenceLayer::new(primary.clone(), Arc::new(MemoryStore::new()));

    let env = message("bob", "once");
    layer.store(&env).await.unwrap();
    let again = layer.store(&env).await.unwrap();
    assert!(!again.inserted);

    assert_eq!(primary.recent(10, None).await.unwrap().len(), 1);
    let analytics = layer.analytics(Duration::from_secs(300)).await.unwrap();
    assert_eq!(analytics.total_messages, 1);
    assert_eq!(analytics.active_senders, 1);
    assert_eq!(analytics.count_for("simple_message"), 1);
}

#[tokio::test]
async fn test_recent_filters_by_agent() {
    let primary = Arc::new(MemoryStore::new());
    let layer = PersistenceLayer::new(primary, Arc::new(MemoryStore::new()));

    layer.store(&message("alice", "a1")).await.unwrap();
    layer.store(&message("bob", "b1")).await.unwrap();
    let mut targeted = message("carol", "to alice");
    targeted.target = Some(AgentId::from("alice"));
    layer.store(&targeted).await.unwrap();

    let alice = layer.recent(10, Some(&AgentId::from("alice"))).await.unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice
        .iter()
        .all(|e| e.source.as_str() == "alice" || e.target == Some(AgentId::from("alice"))));
}
