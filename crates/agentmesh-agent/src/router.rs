//! Outbound envelope construction and inbound dispatch.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentmesh_network::{ConnectionManager, PublishOutcome, RawMessage};
use agentmesh_protocol::{codec, AgentId, Channels, MessageEnvelope, MessageType, Payload};
use agentmesh_state::{MeshState, RegistryEffect};
use agentmesh_store::PersistenceLayer;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::error::RouterError;
use crate::handler::{HandlerContext, MessageHandler, WorkQueue};

#[derive(Default)]
pub(crate) struct RouterCounters {
    sent: AtomicU64,
    unheard: AtomicU64,
    buffered: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    decode_errors: AtomicU64,
    self_echoes: AtomicU64,
    duplicates: AtomicU64,
    not_addressed: AtomicU64,
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
    persist_failures: AtomicU64,
    responses_matched: AtomicU64,
    request_timeouts: AtomicU64,
}

impl RouterCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub sent: u64,
    /// Sends accepted while no peer was subscribed.
    pub unheard: u64,
    /// Sends held in the outbound buffer because the link was down.
    pub buffered: u64,
    pub send_failures: u64,
    pub received: u64,
    pub decode_errors: u64,
    pub self_echoes: u64,
    pub duplicates: u64,
    pub not_addressed: u64,
    pub dispatched: u64,
    pub unhandled: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
    pub persist_failures: u64,
    pub responses_matched: u64,
    pub request_timeouts: u64,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub channel: String,
    pub outcome: PublishOutcome,
}

struct PendingRequest {
    /// Only a response from this agent completes the request, if set.
    expected: Option<AgentId>,
    reply: oneshot::Sender<MessageEnvelope>,
}

/// Cloneable handle for sending envelopes as the local agent.
#[derive(Clone)]
pub struct MessageSender {
    agent_id: AgentId,
    broadcast_channel: String,
    connection: Arc<ConnectionManager>,
    persistence: Arc<PersistenceLayer>,
    mesh: Arc<RwLock<MeshState>>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    counters: Arc<RouterCounters>,
}

impl MessageSender {
    pub(crate) fn new(
        agent_id: AgentId,
        broadcast_channel: String,
        connection: Arc<ConnectionManager>,
        persistence: Arc<PersistenceLayer>,
        mesh: Arc<RwLock<MeshState>>,
    ) -> Self {
        Self {
            agent_id,
            broadcast_channel,
            connection,
            persistence,
            mesh,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Build, log and publish an envelope from the local agent.
    ///
    /// `target = None` broadcasts; otherwise the envelope goes to the
    /// target's direct channel.
    pub async fn send(
        &self,
        kind: MessageType,
        target: Option<AgentId>,
        payload: Payload,
        priority: u8,
    ) -> Result<SendReceipt, RouterError> {
        let envelope =
            MessageEnvelope::new(kind, self.agent_id.clone(), target, payload)?.with_priority(priority);
        self.publish(&envelope).await
    }

    /// Send and wait up to `timeout` for the matching `agent_response`.
    ///
    /// The outcome feeds the interaction tracker: a response counts by its
    /// `success` flag, while timeouts and failed sends count as failures
    /// against `target`.
    pub async fn request(
        &self,
        kind: MessageType,
        target: Option<AgentId>,
        payload: Payload,
        priority: u8,
        timeout: Duration,
    ) -> Result<MessageEnvelope, RouterError> {
        let envelope = MessageEnvelope::new(kind, self.agent_id.clone(), target.clone(), payload)?
            .with_priority(priority);
        let request_id = envelope.id.clone();

        let (reply, response) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                expected: target.clone(),
                reply,
            },
        );

        let started = Instant::now();
        if let Err(e) = self.publish(&envelope).await {
            self.pending.lock().await.remove(&request_id);
            if let Some(peer) = &target {
                self.record_interaction(peer, false, started.elapsed()).await;
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => {
                let success = match &response.payload {
                    Payload::AgentResponse(params) => params.success,
                    _ => true,
                };
                self.record_interaction(&response.source, success, started.elapsed())
                    .await;
                Ok(response)
            }
            Ok(Err(_)) => Err(RouterError::Cancelled(request_id)),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                RouterCounters::bump(&self.counters.request_timeouts);
                if let Some(peer) = &target {
                    self.record_interaction(peer, false, timeout).await;
                }
                tracing::debug!(request_id = %request_id, ?timeout, "Request timed out");
                Err(RouterError::Timeout {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RouterStats {
            sent: load(&c.sent),
            unheard: load(&c.unheard),
            buffered: load(&c.buffered),
            send_failures: load(&c.send_failures),
            received: load(&c.received),
            decode_errors: load(&c.decode_errors),
            self_echoes: load(&c.self_echoes),
            duplicates: load(&c.duplicates),
            not_addressed: load(&c.not_addressed),
            dispatched: load(&c.dispatched),
            unhandled: load(&c.unhandled),
            handler_errors: load(&c.handler_errors),
            handler_panics: load(&c.handler_panics),
            persist_failures: load(&c.persist_failures),
            responses_matched: load(&c.responses_matched),
            request_timeouts: load(&c.request_timeouts),
        }
    }

    pub(crate) async fn record_interaction(&self, peer: &AgentId, success: bool, latency: Duration) {
        self.mesh
            .write()
            .await
            .record_interaction(peer, success, latency);
    }

    /// Fail every outstanding request. Used at shutdown.
    pub(crate) async fn cancel_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    async fn publish(&self, envelope: &MessageEnvelope) -> Result<SendReceipt, RouterError> {
        let bytes = codec::encode(envelope)?;
        let channel = match &envelope.target {
            Some(target) => Channels::direct(target),
            None => self.broadcast_channel.clone(),
        };

        if let Err(e) = self.persistence.store(envelope).await {
            RouterCounters::bump(&self.counters.persist_failures);
            tracing::warn!(message_id = %envelope.id, error = %e, "Outbound message not persisted");
        }

        match self.connection.publish(&channel, bytes).await {
            Ok(outcome) => {
                match outcome {
                    PublishOutcome::Sent => RouterCounters::bump(&self.counters.sent),
                    PublishOutcome::Buffered => RouterCounters::bump(&self.counters.buffered),
                    PublishOutcome::Unheard => RouterCounters::bump(&self.counters.unheard),
                }
                tracing::trace!(
                    message_id = %envelope.id,
                    kind = %envelope.kind,
                    channel = %channel,
                    ?outcome,
                    "Envelope published"
                );
                Ok(SendReceipt {
                    message_id: envelope.id.clone(),
                    channel,
                    outcome,
                })
            }
            Err(e) => {
                RouterCounters::bump(&self.counters.send_failures);
                tracing::warn!(message_id = %envelope.id, channel = %channel, error = %e, "Send failed");
                Err(RouterError::Publish(e))
            }
        }
    }

    /// Hand a response to its waiting request, if any.
    async fn complete_pending(&self, request_id: &str, response: &MessageEnvelope) -> bool {
        let mut pending = self.pending.lock().await;
        let matches = pending
            .get(request_id)
            .is_some_and(|p| p.expected.as_ref().map_or(true, |e| *e == response.source));
        if !matches {
            return false;
        }
        match pending.remove(request_id) {
            Some(request) => request.reply.send(response.clone()).is_ok(),
            None => false,
        }
    }
}

/// How one inbound raw message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Malformed,
    SelfEcho,
    /// Already persisted once; not dispatched again.
    Duplicate,
    /// Targeted at another agent; persisted but not dispatched.
    NotAddressed,
    /// Delivered to a waiting [`MessageSender::request`].
    Response,
    Dispatched(MessageType),
    /// Discovery or status traffic with no dedicated handler; applied to the
    /// registry only.
    Observed(MessageType),
    /// No handler registered for the type; logged and persisted only.
    Unhandled(MessageType),
    HandlerFailed(MessageType),
}

/// Inbound half: decodes, filters, persists and dispatches.
pub struct Dispatcher {
    sender: MessageSender,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
    default_handler: Option<Arc<dyn MessageHandler>>,
    work: WorkQueue,
}

impl Dispatcher {
    pub(crate) fn new(
        sender: MessageSender,
        handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
        default_handler: Option<Arc<dyn MessageHandler>>,
        work: WorkQueue,
    ) -> Self {
        Self {
            sender,
            handlers,
            default_handler,
            work,
        }
    }

    pub async fn on_receive(&self, raw: &RawMessage) -> InboundOutcome {
        let counters = &self.sender.counters;
        RouterCounters::bump(&counters.received);

        let envelope = match codec::decode(&raw.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                RouterCounters::bump(&counters.decode_errors);
                tracing::warn!(
                    channel = %raw.channel,
                    field = e.field().unwrap_or("-"),
                    error = %e,
                    "Dropping malformed envelope"
                );
                return InboundOutcome::Malformed;
            }
        };

        if envelope.source == self.sender.agent_id {
            RouterCounters::bump(&counters.self_echoes);
            return InboundOutcome::SelfEcho;
        }

        match self.sender.persistence.store(&envelope).await {
            Ok(receipt) if !receipt.inserted => {
                RouterCounters::bump(&counters.duplicates);
                tracing::debug!(message_id = %envelope.id, "Duplicate envelope ignored");
                return InboundOutcome::Duplicate;
            }
            Ok(_) => {}
            Err(e) => {
                RouterCounters::bump(&counters.persist_failures);
                tracing::warn!(message_id = %envelope.id, error = %e, "Inbound message not persisted");
            }
        }

        let effect = self.sender.mesh.write().await.observe(&envelope, Utc::now());
        match effect {
            RegistryEffect::Announced(outcome) => {
                tracing::debug!(agent = %envelope.source, ?outcome, "Capability announcement");
            }
            RegistryEffect::Withdrawn => {
                tracing::info!(agent = %envelope.source, "Agent withdrew from the network");
            }
            RegistryEffect::Touched { created: true } => {
                tracing::debug!(agent = %envelope.source, "Discovered agent from traffic");
            }
            _ => {}
        }

        if let Payload::AgentResponse(params) = &envelope.payload {
            if let Some(request_id) = &params.in_reply_to {
                if self.sender.complete_pending(request_id, &envelope).await {
                    RouterCounters::bump(&counters.responses_matched);
                    return InboundOutcome::Response;
                }
            }
        }

        if !envelope.is_addressed_to(&self.sender.agent_id) {
            RouterCounters::bump(&counters.not_addressed);
            return InboundOutcome::NotAddressed;
        }

        self.dispatch(&envelope)
    }

    fn dispatch(&self, envelope: &MessageEnvelope) -> InboundOutcome {
        let counters = &self.sender.counters;
        let kind = envelope.kind.clone();
        let registry_only = kind.is_discovery() || kind == MessageType::StatusUpdate;
        let handler = match self.handlers.get(&kind) {
            Some(handler) => Some(handler),
            None if registry_only => return InboundOutcome::Observed(kind),
            None => self.default_handler.as_ref(),
        };
        let Some(handler) = handler else {
            RouterCounters::bump(&counters.unhandled);
            tracing::debug!(
                message_id = %envelope.id,
                kind = %kind,
                source = %envelope.source,
                "No handler registered"
            );
            return InboundOutcome::Unhandled(kind);
        };

        let ctx = HandlerContext::new(
            self.sender.agent_id.clone(),
            self.work.clone(),
            self.sender.clone(),
        );
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope, &ctx))) {
            Ok(Ok(())) => {
                RouterCounters::bump(&counters.dispatched);
                InboundOutcome::Dispatched(kind)
            }
            Ok(Err(e)) => {
                RouterCounters::bump(&counters.handler_errors);
                tracing::warn!(message_id = %envelope.id, kind = %kind, error = %format!("{e:#}"), "Handler failed");
                InboundOutcome::HandlerFailed(kind)
            }
            Err(_) => {
                RouterCounters::bump(&counters.handler_panics);
                tracing::error!(message_id = %envelope.id, kind = %kind, "Handler panicked");
                InboundOutcome::HandlerFailed(kind)
            }
        }
    }
}
