//! Registry and interaction history owned together by one agent.

use std::time::Duration;

use agentmesh_protocol::{AgentId, MessageEnvelope, Payload};
use chrono::{DateTime, Utc};

use crate::interaction::{InteractionSummary, InteractionTracker};
use crate::matcher;
use crate::registry::{AgentRegistry, UpsertOutcome};

/// What an inbound envelope did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEffect {
    /// Plain traffic refreshed (or created) the sender's entry.
    Touched { created: bool },
    Announced(UpsertOutcome),
    Withdrawn,
    StatusChanged,
    /// Out-of-date or inconsistent update, left unapplied.
    Ignored,
}

#[derive(Debug)]
pub struct MeshState {
    pub registry: AgentRegistry,
    pub interactions: InteractionTracker,
}

impl MeshState {
    pub fn new(ttl: Duration, interaction_window: usize) -> Self {
        Self {
            registry: AgentRegistry::new(ttl),
            interactions: InteractionTracker::new(interaction_window),
        }
    }

    /// Apply the registry side effects of an envelope received at `now`.
    ///
    /// Receipt time, not the sender's timestamp, drives `last_seen`, so clock
    /// skew between agents cannot keep an entry alive or expire it early.
    pub fn observe(&mut self, envelope: &MessageEnvelope, now: DateTime<Utc>) -> RegistryEffect {
        let source = &envelope.source;
        let effect = match &envelope.payload {
            Payload::CapabilityAnnounce(capabilities) => {
                if capabilities.agent_id != *source {
                    tracing::warn!(
                        source = %source,
                        claimed = %capabilities.agent_id,
                        "Announcement for another agent ignored"
                    );
                    let created = self.registry.touch(source, now);
                    return self.with_history(source, RegistryEffect::Touched { created });
                }
                let outcome = self.registry.upsert(capabilities.clone().seen_at(now));
                RegistryEffect::Announced(outcome)
            }
            Payload::CapabilityWithdraw(_) => {
                if self.registry.mark_offline(source, now) {
                    RegistryEffect::Withdrawn
                } else {
                    RegistryEffect::Ignored
                }
            }
            Payload::StatusUpdate(update) => {
                if self.registry.set_status(source, update.status, now) {
                    RegistryEffect::StatusChanged
                } else {
                    RegistryEffect::Ignored
                }
            }
            _ => RegistryEffect::Touched {
                created: self.registry.touch(source, now),
            },
        };
        self.with_history(source, effect)
    }

    /// Record an exchange outcome and mirror the aggregate onto the registry.
    pub fn record_interaction(
        &mut self,
        peer_id: &AgentId,
        success: bool,
        latency: Duration,
    ) -> InteractionSummary {
        let summary = self.interactions.record(peer_id, success, latency);
        self.registry.set_interaction_summary(peer_id, summary);
        summary
    }

    pub fn find_best_agents<I, S>(&self, required: I, limit: Option<usize>) -> Vec<AgentId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        matcher::find_best_agents(&self.registry, required, limit)
    }

    /// Evict stale entries and drop their interaction history.
    ///
    /// History for peers that never registered is dropped once its newest
    /// record is older than the registry TTL.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<AgentId> {
        let evicted = self.registry.evict_stale(now);
        for agent_id in &evicted {
            self.interactions.forget(agent_id);
        }
        let registry = &self.registry;
        let orphans = self
            .interactions
            .forget_idle(now - registry.ttl(), |peer_id| registry.contains(peer_id));
        if !orphans.is_empty() {
            tracing::debug!(count = orphans.len(), "Dropped history of unregistered peers");
        }
        evicted
    }

    // A peer may have history from requests made before it announced.
    fn with_history(&mut self, agent_id: &AgentId, effect: RegistryEffect) -> RegistryEffect {
        if matches!(
            effect,
            RegistryEffect::Touched { created: true } | RegistryEffect::Announced(UpsertOutcome::Inserted)
        ) {
            let summary = self.interactions.get_summary(agent_id);
            self.registry.set_interaction_summary(agent_id, summary);
        }
        effect
    }
}
