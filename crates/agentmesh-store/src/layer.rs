//! Primary/fallback persistence with transparent failover.
//!
//! Writes go to the primary store. When the primary fails, the same write
//! goes to the fallback and the layer reports itself degraded; the caller
//! only sees an error if both fail. Reads try the primary first. The two
//! backends are never reconciled.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_protocol::{AgentId, MessageEnvelope};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;

use crate::store::{MessageAnalytics, MessageStore};
use crate::StorageError;

/// Which backend served an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Primary,
    Fallback,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Fallback => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Primary
        } else {
            Self::Fallback
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    Healthy,
    /// Serving from the fallback.
    Degraded,
    Unavailable,
}

/// Outcome of a successful [`PersistenceLayer::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReceipt {
    pub backend: StorageBackend,
    /// False when the id was already present on that backend.
    pub inserted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub stored: u64,
    pub duplicates: u64,
    pub primary_failures: u64,
    pub fallback_writes: u64,
    /// Writes that failed on both backends.
    pub failures: u64,
    /// Writes still in flight when a drain deadline expired.
    pub abandoned: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageHealth {
    pub status: StorageStatus,
    pub storage_backend: StorageBackend,
    pub primary: &'static str,
    pub fallback: &'static str,
    pub stats: StorageStats,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    duplicates: AtomicU64,
    primary_failures: AtomicU64,
    fallback_writes: AtomicU64,
    failures: AtomicU64,
    abandoned: AtomicU64,
}

pub struct PersistenceLayer {
    primary: Arc<dyn MessageStore>,
    fallback: Arc<dyn MessageStore>,
    /// Backend that took the most recent write.
    last_backend: AtomicU8,
    counters: Counters,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlight<'a>(&'a PersistenceLayer);

impl<'a> InFlight<'a> {
    fn enter(layer: &'a PersistenceLayer) -> Self {
        layer.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(layer)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl PersistenceLayer {
    pub fn new(primary: Arc<dyn MessageStore>, fallback: Arc<dyn MessageStore>) -> Self {
        Self {
            primary,
            fallback,
            last_backend: AtomicU8::new(StorageBackend::Primary.to_u8()),
            counters: Counters::default(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Persist `envelope`. Idempotent on its id.
    pub async fn store(&self, envelope: &MessageEnvelope) -> Result<StoreReceipt, StorageError> {
        let _guard = InFlight::enter(self);

        let backend = match self.primary.put(envelope).await {
            Ok(inserted) => {
                self.note_backend(StorageBackend::Primary);
                return Ok(self.receipt(StorageBackend::Primary, inserted));
            }
            Err(e) => {
                self.counters.primary_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    store = self.primary.name(),
                    message_id = %envelope.id,
                    error = %e,
                    "Primary store write failed, using fallback"
                );
                StorageBackend::Fallback
            }
        };

        match self.fallback.put(envelope).await {
            Ok(inserted) => {
                self.counters.fallback_writes.fetch_add(1, Ordering::Relaxed);
                self.note_backend(backend);
                Ok(self.receipt(backend, inserted))
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    store = self.fallback.name(),
                    message_id = %envelope.id,
                    error = %e,
                    "Fallback store write failed, message not persisted"
                );
                Err(e)
            }
        }
    }

    /// Up to `limit` envelopes, newest first, optionally for one agent.
    pub async fn recent(
        &self,
        limit: usize,
        agent: Option<&AgentId>,
    ) -> Result<Vec<MessageEnvelope>, StorageError> {
        match self.primary.recent(limit, agent).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                tracing::debug!(error = %e, "Primary read failed, reading fallback");
                self.fallback.recent(limit, agent).await
            }
        }
    }

    /// Message counts over the last `window`.
    pub async fn analytics(&self, window: Duration) -> Result<MessageAnalytics, StorageError> {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let since = Utc::now() - window;
        match self.primary.analytics(since).await {
            Ok(analytics) => Ok(analytics),
            Err(e) => {
                tracing::debug!(error = %e, "Primary analytics failed, reading fallback");
                self.fallback.analytics(since).await
            }
        }
    }

    /// Probe both backends. Has no effect on where writes go.
    pub async fn health_check(&self) -> StorageHealth {
        let (status, storage_backend) = if self.primary.ping().await.is_ok() {
            (StorageStatus::Healthy, StorageBackend::Primary)
        } else if self.fallback.ping().await.is_ok() {
            (StorageStatus::Degraded, StorageBackend::Fallback)
        } else {
            (StorageStatus::Unavailable, StorageBackend::Fallback)
        };
        StorageHealth {
            status,
            storage_backend,
            primary: self.primary.name(),
            fallback: self.fallback.name(),
            stats: self.stats(),
        }
    }

    /// Backend that accepted the most recent write.
    pub fn last_backend(&self) -> StorageBackend {
        StorageBackend::from_u8(self.last_backend.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait up to `grace` for in-flight writes to finish. Returns how many
    /// were still pending at the deadline; those are counted as abandoned.
    pub async fn drain(&self, grace: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let abandoned = self.in_flight() as u64;
                if abandoned > 0 {
                    self.counters.abandoned.fetch_add(abandoned, Ordering::Relaxed);
                    tracing::warn!(abandoned, "Persistence drain deadline reached");
                }
                return abandoned;
            }
        }
    }

    pub fn stats(&self) -> StorageStats {
        let c = &self.counters;
        StorageStats {
            stored: c.stored.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            primary_failures: c.primary_failures.load(Ordering::Relaxed),
            fallback_writes: c.fallback_writes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    fn receipt(&self, backend: StorageBackend, inserted: bool) -> StoreReceipt {
        if inserted {
            self.counters.stored.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        StoreReceipt { backend, inserted }
    }

    fn note_backend(&self, backend: StorageBackend) {
        let previous = StorageBackend::from_u8(self.last_backend.swap(backend.to_u8(), Ordering::SeqCst));
        if previous != backend {
            match backend {
                StorageBackend::Primary => tracing::info!("Primary store recovered"),
                StorageBackend::Fallback => tracing::warn!(
                    fallback = self.fallback.name(),
                    "Persistence degraded to fallback store"
                ),
            }
        }
    }
}
