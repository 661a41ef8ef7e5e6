//! Rolling record of exchange outcomes per peer.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use agentmesh_protocol::{AgentId, DEFAULT_INTERACTION_WINDOW};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed exchange with a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub peer_id: AgentId,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over a peer's recent interactions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractionSummary {
    pub sample_count: usize,
    /// Fraction of successful exchanges, 0.0..=1.0.
    pub success_rate: f64,
    pub mean_latency: Duration,
}

impl InteractionSummary {
    /// Summary for a peer with no history. Never penalizes newcomers.
    pub const NEUTRAL: Self = Self {
        sample_count: 0,
        success_rate: 1.0,
        mean_latency: Duration::ZERO,
    };

    fn from_records<'a>(records: impl ExactSizeIterator<Item = &'a InteractionRecord>) -> Self {
        let sample_count = records.len();
        if sample_count == 0 {
            return Self::NEUTRAL;
        }
        let (successes, total_latency) = records.fold((0usize, Duration::ZERO), |(ok, lat), r| {
            (ok + usize::from(r.success), lat.saturating_add(r.latency))
        });
        Self {
            sample_count,
            success_rate: successes as f64 / sample_count as f64,
            mean_latency: total_latency / sample_count as u32,
        }
    }
}

impl Default for InteractionSummary {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Keeps the last `window` records for every peer.
#[derive(Debug)]
pub struct InteractionTracker {
    window: usize,
    records: HashMap<AgentId, VecDeque<InteractionRecord>>,
}

impl InteractionTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            records: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Record an outcome observed now and return the peer's new aggregate.
    pub fn record(&mut self, peer_id: &AgentId, success: bool, latency: Duration) -> InteractionSummary {
        self.push(InteractionRecord {
            peer_id: peer_id.clone(),
            success,
            latency,
            timestamp: Utc::now(),
        })
    }

    /// Append an existing record, evicting the oldest past the window.
    pub fn push(&mut self, record: InteractionRecord) -> InteractionSummary {
        let peer_id = record.peer_id.clone();
        let records = self.records.entry(peer_id.clone()).or_default();
        if records.len() >= self.window {
            records.pop_front();
        }
        records.push_back(record);
        let summary = InteractionSummary::from_records(records.iter());
        tracing::trace!(
            peer = %peer_id,
            samples = summary.sample_count,
            success_rate = summary.success_rate,
            "Interaction recorded"
        );
        summary
    }

    pub fn get_summary(&self, peer_id: &AgentId) -> InteractionSummary {
        self.records
            .get(peer_id)
            .map(|records| InteractionSummary::from_records(records.iter()))
            .unwrap_or(InteractionSummary::NEUTRAL)
    }

    /// Most recent records for `peer_id`, oldest first.
    pub fn history(&self, peer_id: &AgentId) -> Vec<InteractionRecord> {
        self.records
            .get(peer_id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&mut self, peer_id: &AgentId) {
        self.records.remove(peer_id);
    }

    /// Drop history for peers that fail `keep` and whose newest record is
    /// older than `cutoff`. Returns the forgotten peers.
    pub fn forget_idle<F>(&mut self, cutoff: DateTime<Utc>, mut keep: F) -> Vec<AgentId>
    where
        F: FnMut(&AgentId) -> bool,
    {
        let mut forgotten = Vec::new();
        self.records.retain(|peer_id, records| {
            let idle = records.back().map_or(true, |r| r.timestamp < cutoff);
            if idle && !keep(peer_id) {
                forgotten.push(peer_id.clone());
                false
            } else {
                true
            }
        });
        forgotten
    }

    /// Number of peers with at least one record.
    pub fn tracked_peers(&self) -> usize {
        self.records.len()
    }
}

impl Default for InteractionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_INTERACTION_WINDOW)
    }
}
