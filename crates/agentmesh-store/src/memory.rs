//! Non-durable message log for tests and ephemeral agents.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use agentmesh_protocol::{AgentId, MessageEnvelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::{MessageAnalytics, MessageStore};
use crate::StorageError;

#[derive(Default)]
struct Log {
    ids: HashSet<String>,
    /// Insertion order breaks timestamp ties in `recent`.
    messages: Vec<MessageEnvelope>,
}

/// In-memory [`MessageStore`] that can be made unreachable on demand.
pub struct MemoryStore {
    log: Mutex<Log>,
    available: AtomicBool,
    name: &'static str,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            log: Mutex::new(Log::default()),
            available: AtomicBool::new(true),
            name,
        }
    }

    /// Simulate the backend going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!("{} store offline", self.name)))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Log>, StorageError> {
        self.log
            .lock()
            .map_err(|_| StorageError::Backend("log lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn put(&self, envelope: &MessageEnvelope) -> Result<bool, StorageError> {
        self.check()?;
        let mut log = self.lock()?;
        if !log.ids.insert(envelope.id.clone()) {
            return Ok(false);
        }
        log.messages.push(envelope.clone());
        Ok(true)
    }

    async fn recent(
        &self,
        limit: usize,
        agent: Option<&AgentId>,
    ) -> Result<Vec<MessageEnvelope>, StorageError> {
        self.check()?;
        let log = self.lock()?;
        let mut matching: Vec<(usize, &MessageEnvelope)> = log
            .messages
            .iter()
            .enumerate()
            .filter(|(_, env)| {
                agent.map_or(true, |a| env.source == *a || env.target.as_ref() == Some(a))
            })
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, env)| env.clone())
            .collect())
    }

    async fn analytics(&self, since: DateTime<Utc>) -> Result<MessageAnalytics, StorageError> {
        self.check()?;
        let log = self.lock()?;
        let mut message_counts = BTreeMap::new();
        let mut senders = BTreeSet::new();
        let mut total_messages = 0;
        for env in log.messages.iter().filter(|env| env.timestamp >= since) {
            *message_counts.entry(env.kind.as_str().to_string()).or_insert(0) += 1;
            senders.insert(env.source.clone());
            total_messages += 1;
        }
        Ok(MessageAnalytics {
            message_counts,
            total_messages,
            active_senders: senders.len() as u64,
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
