//! The agent runtime: one object owning the connection, persistence,
//! registry and dispatch loop of a single local agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentmesh_network::{
    ConnectionHealth, ConnectionManager, GossipTransport, Subscription, Transport,
};
use agentmesh_protocol::{
    AgentId, AgentStatus, Channels, MessageEnvelope, MessageType, NetworkStats, Payload,
};
use agentmesh_state::{InteractionSummary, MeshState, RegistryEntry};
use agentmesh_store::{PersistenceLayer, SqliteStore, StorageHealth};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{AgentConfig, ConfigError, TransportKind};
use crate::discovery::{DiscoveryFilter, DiscoveryProtocol, DiscoveryState};
use crate::error::RuntimeError;
use crate::handler::{MessageHandler, WorkQueue, WorkQueueStats, WorkerHandle};
use crate::router::{Dispatcher, MessageSender, RouterStats, SendReceipt};

/// Everything [`AgentRuntime::health`] reports.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub discovery: DiscoveryState,
    pub connection: ConnectionHealth,
    pub storage: StorageHealth,
    pub router: RouterStats,
    pub work_queue: WorkQueueStats,
    /// Registry size, including offline entries awaiting eviction.
    pub known_agents: usize,
    pub active_agents: usize,
    pub uptime_secs: u64,
}

/// What [`AgentRuntime::shutdown`] had to give up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub abandoned_work: u64,
    pub abandoned_writes: u64,
    pub abandoned_buffered: u64,
    pub cancelled_requests: usize,
    /// Whether the departure notice reached the transport.
    pub withdrawn: bool,
    pub elapsed: Duration,
}

pub struct AgentRuntimeBuilder {
    config: AgentConfig,
    transport: Option<Arc<dyn Transport>>,
    persistence: Option<Arc<PersistenceLayer>>,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
    default_handler: Option<Arc<dyn MessageHandler>>,
}

impl AgentRuntimeBuilder {
    /// Use this transport instead of the one named in the config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this persistence layer instead of the configured SQLite files.
    pub fn persistence(mut self, persistence: Arc<PersistenceLayer>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn handler(mut self, kind: MessageType, handler: impl MessageHandler) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Receives every addressed envelope whose type has no handler.
    pub fn default_handler(mut self, handler: impl MessageHandler) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Connect, subscribe, announce, and spawn the event loop.
    pub async fn start(self) -> Result<AgentRuntime, RuntimeError> {
        let mut config = self.config;
        config.validate()?;
        let agent_id = config.ensure_agent_id();

        let transport: Arc<dyn Transport> = match (self.transport, config.transport.kind) {
            (Some(transport), _) => transport,
            (None, TransportKind::Gossip) => Arc::new(GossipTransport::new(config.gossip_config())),
            (None, TransportKind::Memory) => {
                return Err(ConfigError::Invalid(
                    "transport.kind = \"memory\" requires an injected transport".into(),
                )
                .into())
            }
        };

        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => {
                let primary = SqliteStore::new(config.storage.primary_path_for(&agent_id))
                    .with_name("sqlite");
                let fallback = SqliteStore::open(config.storage.fallback_path_for(&agent_id))?
                    .with_name("sqlite-fallback");
                Arc::new(PersistenceLayer::new(Arc::new(primary), Arc::new(fallback)))
            }
        };

        let connection = ConnectionManager::connect(transport, config.connection_config()).await?;
        let broadcast_channel = config.discovery.broadcast_channel.clone();
        let broadcast = connection.subscribe(&broadcast_channel).await?;
        let direct = connection.subscribe(&Channels::direct(&agent_id)).await?;

        let mesh = Arc::new(RwLock::new(MeshState::new(
            config.registry_ttl(),
            config.interactions.window,
        )));
        let sender = MessageSender::new(
            agent_id.clone(),
            broadcast_channel,
            Arc::clone(&connection),
            Arc::clone(&persistence),
            Arc::clone(&mesh),
        );

        let (work, worker) = WorkQueue::new(config.runtime.work_queue_capacity);
        let worker = worker.spawn();
        let dispatcher = Dispatcher::new(
            sender.clone(),
            self.handlers,
            self.default_handler,
            work.clone(),
        );

        let discovery = Arc::new(DiscoveryProtocol::new(
            sender.clone(),
            Arc::clone(&mesh),
            config.capabilities(&agent_id),
        ));
        discovery.start().await;

        let (stop, stop_rx) = oneshot::channel();
        let event_loop = EventLoop {
            dispatcher,
            discovery: Arc::clone(&discovery),
            mesh: Arc::clone(&mesh),
            broadcast,
            direct,
            announce_interval: config.announce_interval(),
            eviction_interval: config.eviction_interval(),
        };
        let task = tokio::spawn(event_loop.run(stop_rx));

        tracing::info!(agent = %agent_id, "Agent runtime started");

        Ok(AgentRuntime {
            agent_id,
            config,
            sender,
            discovery,
            connection,
            persistence,
            mesh,
            work,
            worker: Mutex::new(Some(worker)),
            event_loop: Mutex::new(Some((stop, task))),
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        })
    }
}

struct EventLoop {
    dispatcher: Dispatcher,
    discovery: Arc<DiscoveryProtocol>,
    mesh: Arc<RwLock<MeshState>>,
    broadcast: Subscription,
    direct: Subscription,
    announce_interval: Duration,
    eviction_interval: Duration,
}

impl EventLoop {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let start = tokio::time::Instant::now();
        let mut announce =
            tokio::time::interval_at(start + self.announce_interval, self.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut evict =
            tokio::time::interval_at(start + self.eviction_interval, self.eviction_interval);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut broadcast_open = true;
        let mut direct_open = true;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                raw = self.broadcast.recv(), if broadcast_open => match raw {
                    Some(raw) => {
                        self.dispatcher.on_receive(&raw).await;
                    }
                    None => {
                        tracing::warn!(channel = self.broadcast.channel(), "Subscription ended");
                        broadcast_open = false;
                    }
                },
                raw = self.direct.recv(), if direct_open => match raw {
                    Some(raw) => {
                        self.dispatcher.on_receive(&raw).await;
                    }
                    None => {
                        tracing::warn!(channel = self.direct.channel(), "Subscription ended");
                        direct_open = false;
                    }
                },
                _ = announce.tick() => {
                    self.discovery.tick().await;
                }
                _ = evict.tick() => {
                    let evicted = self.mesh.write().await.evict_stale(Utc::now());
                    if !evicted.is_empty() {
                        tracing::info!(count = evicted.len(), agents = ?evicted, "Evicted stale agents");
                    }
                }
            }
        }
        tracing::debug!("Event loop stopped");
    }
}

/// A running local agent. Construct with [`AgentRuntime::builder`].
pub struct AgentRuntime {
    agent_id: AgentId,
    config: AgentConfig,
    sender: MessageSender,
    discovery: Arc<DiscoveryProtocol>,
    connection: Arc<ConnectionManager>,
    persistence: Arc<PersistenceLayer>,
    mesh: Arc<RwLock<MeshState>>,
    work: WorkQueue,
    worker: Mutex<Option<WorkerHandle>>,
    event_loop: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    started_at: Instant,
    shut_down: AtomicBool,
}

impl AgentRuntime {
    pub fn builder(config: AgentConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder {
            config,
            transport: None,
            persistence: None,
            handlers: HashMap::new(),
            default_handler: None,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cloneable send handle, usable from other tasks.
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub async fn send(
        &self,
        kind: MessageType,
        target: Option<AgentId>,
        payload: Payload,
        priority: u8,
    ) -> Result<SendReceipt, RuntimeError> {
        self.ensure_running()?;
        Ok(self.sender.send(kind, target, payload, priority).await?)
    }

    /// Send and await the correlated `agent_response` within the configured timeout.
    pub async fn request(
        &self,
        kind: MessageType,
        target: Option<AgentId>,
        payload: Payload,
        priority: u8,
    ) -> Result<MessageEnvelope, RuntimeError> {
        self.request_with_timeout(kind, target, payload, priority, self.config.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        kind: MessageType,
        target: Option<AgentId>,
        payload: Payload,
        priority: u8,
        timeout: Duration,
    ) -> Result<MessageEnvelope, RuntimeError> {
        self.ensure_running()?;
        Ok(self
            .sender
            .request(kind, target, payload, priority, timeout)
            .await?)
    }

    pub async fn discover_agents(&self, filter: &DiscoveryFilter) -> Vec<RegistryEntry> {
        self.discovery.discover_agents(filter).await
    }

    pub async fn find_best_agents<I, S>(&self, required: I, limit: Option<usize>) -> Vec<AgentId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mesh.read().await.find_best_agents(required, limit)
    }

    /// Record an exchange outcome observed outside [`AgentRuntime::request`].
    pub async fn record_interaction(
        &self,
        peer: &AgentId,
        success: bool,
        latency: Duration,
    ) -> InteractionSummary {
        self.mesh
            .write()
            .await
            .record_interaction(peer, success, latency)
    }

    pub async fn interaction_summary(&self, peer: &AgentId) -> InteractionSummary {
        self.mesh.read().await.interactions.get_summary(peer)
    }

    pub async fn set_status(
        &self,
        status: AgentStatus,
        detail: Option<String>,
    ) -> Result<SendReceipt, RuntimeError> {
        self.ensure_running()?;
        Ok(self.discovery.set_status(status, detail).await?)
    }

    /// Publish the local advertisement now instead of waiting for the timer.
    pub async fn announce(&self) -> Result<SendReceipt, RuntimeError> {
        self.ensure_running()?;
        Ok(self.discovery.announce().await?)
    }

    /// Registry counts plus stored message counts over the last `window`.
    pub async fn network_stats(&self, window: Duration) -> Result<NetworkStats, RuntimeError> {
        let analytics = self.persistence.analytics(window).await?;
        let now = Utc::now();
        let counts = self.mesh.read().await.registry.counts_by_status(now);
        Ok(NetworkStats {
            discovery_manager: self.agent_id.clone(),
            total_agents: counts.total,
            idle_agents: counts.idle,
            busy_agents: counts.busy,
            offline_agents: counts.offline,
            window_secs: window.as_secs(),
            message_counts: analytics.message_counts,
            total_messages: analytics.total_messages,
            active_senders: analytics.active_senders,
            generated_at: now,
        })
    }

    pub async fn health(&self) -> AgentHealth {
        let (known_agents, active_agents) = {
            let mesh = self.mesh.read().await;
            (mesh.registry.len(), mesh.registry.list_active().len())
        };
        AgentHealth {
            agent_id: self.agent_id.clone(),
            discovery: self.discovery.state().await,
            connection: self.connection.health_check().await,
            storage: self.persistence.health_check().await,
            router: self.sender.stats(),
            work_queue: self.work.stats(),
            known_agents,
            active_agents,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Newest persisted envelopes, optionally limited to one agent's traffic.
    pub async fn recent_messages(
        &self,
        limit: usize,
        agent: Option<&AgentId>,
    ) -> Result<Vec<MessageEnvelope>, RuntimeError> {
        Ok(self.persistence.recent(limit, agent).await?)
    }

    /// Shared registry and interaction state.
    pub fn mesh(&self) -> &Arc<RwLock<MeshState>> {
        &self.mesh
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the agent within the configured grace period.
    ///
    /// Order: event loop and timers, deferred work, in-flight writes,
    /// departure notice, pending requests, connection. All steps share one
    /// deadline; whatever is still outstanding when it passes is abandoned
    /// and counted in the report.
    pub async fn shutdown(&self) -> Result<ShutdownReport, RuntimeError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }
        let started = Instant::now();
        let deadline = started + self.config.shutdown_grace();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        if let Some((stop, mut task)) = self.event_loop.lock().await.take() {
            let _ = stop.send(());
            if tokio::time::timeout(remaining(), &mut task).await.is_err() {
                task.abort();
            }
        }

        let abandoned_work = match self.worker.lock().await.take() {
            Some(worker) => worker.drain(remaining()).await,
            None => 0,
        };

        let abandoned_writes = self.persistence.drain(remaining()).await;

        let withdrawn = tokio::time::timeout(
            remaining(),
            self.discovery.stop(Some("shutdown".to_string())),
        )
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Departure notice timed out");
            false
        });

        let cancelled_requests = self.sender.cancel_pending().await;
        let abandoned_buffered = self.connection.close().await;

        let report = ShutdownReport {
            abandoned_work,
            abandoned_writes,
            abandoned_buffered,
            cancelled_requests,
            withdrawn,
            elapsed: started.elapsed(),
        };
        tracing::info!(agent = %self.agent_id, ?report, "Agent runtime stopped");
        Ok(report)
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if self.is_shut_down() {
            Err(RuntimeError::ShutDown)
        } else {
            Ok(())
        }
    }
}
