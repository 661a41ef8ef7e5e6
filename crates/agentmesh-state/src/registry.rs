//! In-memory table of known peers with TTL-based expiry.
//!
//! Entries are refreshed by announcements and by any other observed traffic.
//! Removal happens only in [`AgentRegistry::evict_stale`], which the runtime
//! calls from a periodic timer; lookups never evict. `list_active_at` still
//! hides entries that have outlived the TTL so that staleness does not leak
//! between two eviction ticks.

use std::collections::BTreeMap;
use std::time::Duration;

use agentmesh_protocol::{AgentCapabilities, AgentId, AgentStatus, DEFAULT_REGISTRY_TTL_SECS};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::interaction::InteractionSummary;

/// A registry row: the advertised capabilities plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub capabilities: AgentCapabilities,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub interaction_summary: InteractionSummary,
}

impl RegistryEntry {
    fn new(capabilities: AgentCapabilities) -> Self {
        let seen = capabilities.last_seen;
        Self {
            capabilities,
            first_seen: seen,
            last_seen: seen,
            interaction_summary: InteractionSummary::NEUTRAL,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.capabilities.agent_id
    }

    pub fn status(&self) -> AgentStatus {
        self.capabilities.status
    }

    fn advance(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
            self.capabilities.last_seen = at;
        }
    }
}

/// Result of [`AgentRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Older than what is already stored; ignored.
    Stale,
}

/// Agent counts by advertised status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub idle: u64,
    pub busy: u64,
    /// Includes entries past the TTL that have not been evicted yet.
    pub offline: u64,
}

#[derive(Debug)]
pub struct AgentRegistry {
    ttl: chrono::Duration,
    entries: BTreeMap<AgentId, RegistryEntry>,
}

impl AgentRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5200)),
            entries: BTreeMap::new(),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Insert or refresh an agent's advertisement.
    ///
    /// `capabilities.last_seen` is the observation time. An advertisement
    /// older than the stored one is ignored, so the most recent `last_seen`
    /// wins regardless of arrival order.
    pub fn upsert(&mut self, capabilities: AgentCapabilities) -> UpsertOutcome {
        match self.entries.get_mut(&capabilities.agent_id) {
            None => {
                tracing::debug!(agent = %capabilities.agent_id, "New agent registered");
                self.entries
                    .insert(capabilities.agent_id.clone(), RegistryEntry::new(capabilities));
                UpsertOutcome::Inserted
            }
            Some(entry) if capabilities.last_seen < entry.last_seen => {
                tracing::trace!(agent = %capabilities.agent_id, "Ignoring out-of-date announcement");
                UpsertOutcome::Stale
            }
            Some(entry) => {
                entry.last_seen = capabilities.last_seen;
                entry.capabilities = capabilities;
                UpsertOutcome::Updated
            }
        }
    }

    /// Record activity from `agent_id`. Unknown senders get a bare entry.
    /// Returns true if the entry was created.
    pub fn touch(&mut self, agent_id: &AgentId, at: DateTime<Utc>) -> bool {
        if let Some(entry) = self.entries.get_mut(agent_id) {
            entry.advance(at);
            return false;
        }
        let capabilities = AgentCapabilities::new(agent_id.clone()).seen_at(at);
        self.entries
            .insert(agent_id.clone(), RegistryEntry::new(capabilities));
        tracing::debug!(agent = %agent_id, "Registered agent from observed traffic");
        true
    }

    /// Apply a status change observed at `at`, unless a newer observation
    /// already exists. Returns true if the status was applied.
    pub fn set_status(&mut self, agent_id: &AgentId, status: AgentStatus, at: DateTime<Utc>) -> bool {
        self.touch(agent_id, at);
        match self.entries.get_mut(agent_id) {
            Some(entry) if at >= entry.last_seen => {
                entry.capabilities.status = status;
                true
            }
            _ => false,
        }
    }

    /// Flag an agent offline. The entry is removed by a later eviction.
    pub fn mark_offline(&mut self, agent_id: &AgentId, at: DateTime<Utc>) -> bool {
        if !self.entries.contains_key(agent_id) {
            return false;
        }
        self.set_status(agent_id, AgentStatus::Offline, at)
    }

    pub fn set_interaction_summary(&mut self, agent_id: &AgentId, summary: InteractionSummary) -> bool {
        match self.entries.get_mut(agent_id) {
            Some(entry) => {
                entry.interaction_summary = summary;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&RegistryEntry> {
        self.entries.get(agent_id)
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn list_active(&self) -> Vec<&RegistryEntry> {
        self.list_active_at(Utc::now())
    }

    /// Entries that are neither offline nor past the TTL at `now`, ordered by agent id.
    pub fn list_active_at(&self, now: DateTime<Utc>) -> Vec<&RegistryEntry> {
        self.entries
            .values()
            .filter(|e| e.status() != AgentStatus::Offline && !self.is_expired(e, now))
            .collect()
    }

    /// Every entry, including offline and expired ones, ordered by agent id.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Remove entries whose `last_seen` is older than the TTL. Returns the evicted ids.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<AgentId> {
        let ttl = self.ttl;
        let mut evicted = Vec::new();
        self.entries.retain(|id, entry| {
            let keep = now.signed_duration_since(entry.last_seen) <= ttl;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted stale agents");
        }
        evicted
    }

    pub fn counts_by_status(&self, now: DateTime<Utc>) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.values() {
            counts.total += 1;
            let status = if self.is_expired(entry, now) {
                AgentStatus::Offline
            } else {
                entry.status()
            };
            match status {
                AgentStatus::Idle => counts.idle += 1,
                AgentStatus::Busy => counts.busy += 1,
                AgentStatus::Offline => counts.offline += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &RegistryEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.last_seen) > self.ttl
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_REGISTRY_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn caps(id: &str, at: DateTime<Utc>) -> AgentCapabilities {
        AgentCapabilities::new(AgentId::from(id)).seen_at(at)
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let mut registry = AgentRegistry::default();
        assert_eq!(registry.upsert(caps("a", t(0))), UpsertOutcome::Inserted);
        let updated = caps("a", t(10)).with_capabilities(["python"]);
        assert_eq!(registry.upsert(updated), UpsertOutcome::Updated);

        let entry = registry.get(&AgentId::from("a")).unwrap();
        assert_eq!(entry.first_seen, t(0));
        assert_eq!(entry.last_seen, t(10));
        assert!(entry.capabilities.advertises("python"));
    }

    #[test]
    fn test_older_announcement_loses() {
        let mut registry = AgentRegistry::default();
        registry.upsert(caps("a", t(10)).with_status(AgentStatus::Busy));
        let outcome = registry.upsert(caps("a", t(5)).with_status(AgentStatus::Idle));
        assert_eq!(outcome, UpsertOutcome::Stale);
        let entry = registry.get(&AgentId::from("a")).unwrap();
        assert_eq!(entry.status(), AgentStatus::Busy);
        assert_eq!(entry.last_seen, t(10));
    }

    #[test]
    fn test_touch_creates_bare_entry_and_never_rewinds() {
        let mut registry = AgentRegistry::default();
        let id = AgentId::from("a");
        assert!(registry.touch(&id, t(10)));
        assert!(!registry.touch(&id, t(3)));
        assert_eq!(registry.get(&id).unwrap().last_seen, t(10));
    }

    #[test]
    fn test_stale_entries_hidden_then_evicted() {
        let mut registry = AgentRegistry::new(Duration::from_secs(90));
        registry.upsert(caps("old", t(0)));
        registry.upsert(caps("new", t(60)));

        let active: Vec<_> = registry
            .list_active_at(t(100))
            .into_iter()
            .map(|e| e.agent_id().to_string())
            .collect();
        assert_eq!(active, vec!["new"]);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.evict_stale(t(100)), vec![AgentId::from("old")]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_exactly_ttl_is_still_active() {
        let mut registry = AgentRegistry::new(Duration::from_secs(90));
        registry.upsert(caps("a", t(0)));
        assert_eq!(registry.list_active_at(t(90)).len(), 1);
        assert!(registry.evict_stale(t(90)).is_empty());
    }

    #[test]
    fn test_offline_agents_not_active_but_counted() {
        let mut registry = AgentRegistry::default();
        registry.upsert(caps("a", t(0)));
        registry.upsert(caps("b", t(0)).with_status(AgentStatus::Busy));
        assert!(registry.mark_offline(&AgentId::from("a"), t(1)));
        assert!(!registry.mark_offline(&AgentId::from("ghost"), t(1)));

        assert_eq!(registry.list_active_at(t(2)).len(), 1);
        let counts = registry.counts_by_status(t(2));
        assert_eq!(counts, StatusCounts { total: 2, idle: 0, busy: 1, offline: 1 });
    }

    #[test]
    fn test_set_status_respects_recency() {
        let mut registry = AgentRegistry::default();
        let id = AgentId::from("a");
        registry.upsert(caps("a", t(10)));
        assert!(!registry.set_status(&id, AgentStatus::Busy, t(5)));
        assert!(registry.set_status(&id, AgentStatus::Busy, t(11)));
        assert_eq!(registry.get(&id).unwrap().status(), AgentStatus::Busy);
    }
}
