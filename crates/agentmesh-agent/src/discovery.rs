//! Discovery protocol: announce, re-announce, withdraw, and query the registry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agentmesh_network::PublishOutcome;
use agentmesh_protocol::{
    AgentCapabilities, AgentStatus, MessageType, Payload, StatusUpdateParams, WithdrawParams,
    DEFAULT_PRIORITY,
};
use agentmesh_state::{MeshState, RegistryEntry};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::RouterError;
use crate::router::{MessageSender, SendReceipt};

/// Lifecycle of the local agent's participation in discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryState {
    Stopped,
    /// First announcement is being published.
    Announcing,
    Active,
    /// Departure notice is being published.
    Stopping,
}

/// Criteria for [`DiscoveryProtocol::discover_agents`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Every tag must be advertised as a capability or specialization.
    pub capabilities: BTreeSet<String>,
    pub status: Option<AgentStatus>,
    pub message_type: Option<MessageType>,
}

impl DiscoveryFilter {
    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message_type(mut self, kind: MessageType) -> Self {
        self.message_type = Some(kind);
        self
    }

    fn matches(&self, entry: &RegistryEntry) -> bool {
        let caps = &entry.capabilities;
        if caps.match_count(&self.capabilities) != self.capabilities.len() {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status()) {
            return false;
        }
        match &self.message_type {
            Some(kind) => caps.supported_message_types.contains(kind),
            None => true,
        }
    }
}

pub struct DiscoveryProtocol {
    sender: MessageSender,
    mesh: Arc<RwLock<MeshState>>,
    local: Mutex<AgentCapabilities>,
    state: Mutex<DiscoveryState>,
    announcements: AtomicU64,
}

impl DiscoveryProtocol {
    pub(crate) fn new(
        sender: MessageSender,
        mesh: Arc<RwLock<MeshState>>,
        local: AgentCapabilities,
    ) -> Self {
        Self {
            sender,
            mesh,
            local: Mutex::new(local),
            state: Mutex::new(DiscoveryState::Stopped),
            announcements: AtomicU64::new(0),
        }
    }

    /// Publish the first announcement and enter `Active`.
    ///
    /// A failed announcement does not prevent activation; the periodic
    /// re-announce retries it.
    pub async fn start(&self) {
        *self.state.lock().await = DiscoveryState::Announcing;
        if let Err(e) = self.announce().await {
            tracing::warn!(error = %e, "Initial capability announcement failed");
        }
        *self.state.lock().await = DiscoveryState::Active;
        tracing::info!(agent = %self.sender.agent_id(), "Discovery active");
    }

    /// Broadcast the local advertisement with a fresh `last_seen`.
    pub async fn announce(&self) -> Result<SendReceipt, RouterError> {
        let caps = {
            let mut local = self.local.lock().await;
            local.last_seen = Utc::now();
            local.clone()
        };
        let receipt = self
            .sender
            .send(
                MessageType::CapabilityAnnounce,
                None,
                Payload::CapabilityAnnounce(caps),
                DEFAULT_PRIORITY,
            )
            .await?;
        self.announcements.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(message_id = %receipt.message_id, outcome = ?receipt.outcome, "Announced capabilities");
        Ok(receipt)
    }

    /// Re-announce if active. Called from the announce timer.
    pub(crate) async fn tick(&self) {
        if self.state().await != DiscoveryState::Active {
            return;
        }
        if let Err(e) = self.announce().await {
            tracing::warn!(error = %e, "Periodic announcement failed");
        }
    }

    /// Publish a departure notice and return to `Stopped`.
    ///
    /// Best effort: returns whether the notice reached the transport. A notice
    /// left in the outbox does not count, since closing the connection drops it.
    pub async fn stop(&self, reason: Option<String>) -> bool {
        {
            let mut state = self.state.lock().await;
            if *state == DiscoveryState::Stopped {
                return false;
            }
            *state = DiscoveryState::Stopping;
        }
        let params = WithdrawParams {
            agent_id: self.sender.agent_id().clone(),
            reason,
        };
        let withdrawn = match self
            .sender
            .send(
                MessageType::CapabilityWithdraw,
                None,
                Payload::CapabilityWithdraw(params),
                DEFAULT_PRIORITY,
            )
            .await
        {
            Ok(receipt) if receipt.outcome == PublishOutcome::Sent => true,
            Ok(receipt) => {
                tracing::warn!(outcome = ?receipt.outcome, "Departure notice reached no peer");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Departure notice not published");
                false
            }
        };
        *self.state.lock().await = DiscoveryState::Stopped;
        withdrawn
    }

    /// Change the advertised status and tell the network.
    pub async fn set_status(
        &self,
        status: AgentStatus,
        detail: Option<String>,
    ) -> Result<SendReceipt, RouterError> {
        self.local.lock().await.status = status;
        self.sender
            .send(
                MessageType::StatusUpdate,
                None,
                Payload::StatusUpdate(StatusUpdateParams { status, detail }),
                DEFAULT_PRIORITY,
            )
            .await
    }

    /// Active registry entries matching `filter`, ordered by agent id.
    ///
    /// Reads the local registry only; results are as fresh as the last
    /// announcements received.
    pub async fn discover_agents(&self, filter: &DiscoveryFilter) -> Vec<RegistryEntry> {
        let mesh = self.mesh.read().await;
        mesh.registry
            .list_active_at(Utc::now())
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub async fn local_capabilities(&self) -> AgentCapabilities {
        self.local.lock().await.clone()
    }

    pub async fn state(&self) -> DiscoveryState {
        *self.state.lock().await
    }

    pub fn announcements(&self) -> u64 {
        self.announcements.load(Ordering::Relaxed)
    }
}
