//! Capability-based ranking of registered agents.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use agentmesh_protocol::AgentId;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::{AgentRegistry, RegistryEntry};

/// A ranked candidate with the keys it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentMatch {
    pub agent_id: AgentId,
    pub match_count: usize,
    pub success_rate: f64,
    pub last_seen: DateTime<Utc>,
}

impl AgentMatch {
    fn from_entry(entry: &RegistryEntry, required: &BTreeSet<String>) -> Self {
        Self {
            agent_id: entry.agent_id().clone(),
            match_count: entry.capabilities.match_count(required),
            success_rate: entry.interaction_summary.success_rate,
            last_seen: entry.last_seen,
        }
    }

    /// Best first: more matching tags, then higher success rate, then more
    /// recently seen, then agent id.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .match_count
            .cmp(&self.match_count)
            .then_with(|| other.success_rate.total_cmp(&self.success_rate))
            .then_with(|| other.last_seen.cmp(&self.last_seen))
            .then_with(|| self.agent_id.cmp(&other.agent_id))
    }
}

/// Agents matching at least one of `required`, best first, at most `limit`.
pub fn find_best_agents<I, S>(registry: &AgentRegistry, required: I, limit: Option<usize>) -> Vec<AgentId>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let required: BTreeSet<String> = required.into_iter().map(Into::into).collect();
    ranked_matches(registry, &required, limit, Utc::now())
        .into_iter()
        .map(|m| m.agent_id)
        .collect()
}

/// Full ranking over the entries active at `now`.
///
/// Duplicate tags in the query count once. An empty query matches nothing.
pub fn ranked_matches(
    registry: &AgentRegistry,
    required: &BTreeSet<String>,
    limit: Option<usize>,
    now: DateTime<Utc>,
) -> Vec<AgentMatch> {
    let mut matches: Vec<AgentMatch> = registry
        .list_active_at(now)
        .into_iter()
        .map(|entry| AgentMatch::from_entry(entry, required))
        .filter(|m| m.match_count > 0)
        .collect();
    matches.sort_by(AgentMatch::rank);
    if let Some(limit) = limit {
        matches.truncate(limit);
    }
    matches
}
