//! Contract shared by every message-log backend.

use std::collections::BTreeMap;

use agentmesh_protocol::{AgentId, MessageEnvelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::StorageError;

/// Message counts over a time window, computed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageAnalytics {
    /// Stored envelopes per type tag.
    pub message_counts: BTreeMap<String, u64>,
    pub total_messages: u64,
    /// Distinct `source` agents.
    pub active_senders: u64,
}

impl MessageAnalytics {
    pub fn count_for(&self, kind: &str) -> u64 {
        self.message_counts.get(kind).copied().unwrap_or(0)
    }
}

/// A durable, id-keyed envelope log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store `envelope` unless its id is already present. Returns whether a
    /// new record was written.
    async fn put(&self, envelope: &MessageEnvelope) -> Result<bool, StorageError>;

    /// Up to `limit` envelopes, newest first. With `agent`, only envelopes
    /// that agent sent or was targeted by.
    async fn recent(
        &self,
        limit: usize,
        agent: Option<&AgentId>,
    ) -> Result<Vec<MessageEnvelope>, StorageError>;

    /// Aggregate over envelopes timestamped at or after `since`.
    async fn analytics(&self, since: DateTime<Utc>) -> Result<MessageAnalytics, StorageError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StorageError>;

    fn name(&self) -> &'static str;
}
