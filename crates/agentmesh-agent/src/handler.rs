//! Message handlers and the deferred-work queue they hand long jobs to.
//!
//! A handler runs inline on the dispatch loop for the one envelope it was
//! given, so it must return promptly. Anything slow (I/O, replies, model
//! calls) goes through [`HandlerContext::defer`], which queues it on a
//! bounded queue drained by a single worker task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_protocol::{
    AgentId, AgentResponseParams, MessageEnvelope, MessageType, Payload, DEFAULT_PRIORITY,
};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::router::MessageSender;

/// Handles inbound envelopes of one message type.
///
/// Errors and panics are caught per message and counted; they never stop
/// the dispatch loop.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, envelope: &MessageEnvelope, ctx: &HandlerContext) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&MessageEnvelope, &HandlerContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, envelope: &MessageEnvelope, ctx: &HandlerContext) -> anyhow::Result<()> {
        self(envelope, ctx)
    }
}

/// What a handler can reach while processing one envelope.
pub struct HandlerContext {
    agent_id: AgentId,
    work: WorkQueue,
    sender: MessageSender,
}

impl HandlerContext {
    pub(crate) fn new(agent_id: AgentId, work: WorkQueue, sender: MessageSender) -> Self {
        Self {
            agent_id,
            work,
            sender,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Handle for sending messages, cloneable into deferred work.
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Queue `work` to run after the handler returns.
    pub fn defer<F>(&self, work: F) -> Result<(), WorkQueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.work.defer(work)
    }

    /// Queue an `agent_response` to the sender of `to`.
    pub fn reply(&self, to: &MessageEnvelope, response: AgentResponseParams) -> Result<(), WorkQueueError> {
        let sender = self.sender.clone();
        let target = to.source.clone();
        self.defer(async move {
            let result = sender
                .send(
                    MessageType::AgentResponse,
                    Some(target.clone()),
                    Payload::AgentResponse(response),
                    DEFAULT_PRIORITY,
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(target = %target, error = %e, "Failed to send reply");
            }
        })
    }
}

pub type DeferredWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkQueueError {
    #[error("work queue is full")]
    Full,
    #[error("work queue is closed")]
    Closed,
}

#[derive(Default)]
struct WorkCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    pending: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkQueueStats {
    pub queued: u64,
    pub completed: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub pending: usize,
}

/// Sending half of the deferred-work queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<DeferredWork>,
    counters: Arc<WorkCounters>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> (Self, WorkQueueWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(WorkCounters::default());
        (
            Self {
                tx,
                counters: Arc::clone(&counters),
            },
            WorkQueueWorker { rx, counters },
        )
    }

    /// Queue `work` without waiting. Fails immediately when the queue is full.
    pub fn defer<F>(&self, work: F) -> Result<(), WorkQueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Counted before the send so the worker never decrements first.
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        let result = self.tx.try_send(Box::pin(work));
        if result.is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }
        match result {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Deferred work rejected, queue full");
                Err(WorkQueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(WorkQueueError::Closed)
            }
        }
    }

    pub fn stats(&self) -> WorkQueueStats {
        stats(&self.counters)
    }
}

fn stats(counters: &WorkCounters) -> WorkQueueStats {
    WorkQueueStats {
        queued: counters.queued.load(Ordering::Relaxed),
        completed: counters.completed.load(Ordering::Relaxed),
        rejected: counters.rejected.load(Ordering::Relaxed),
        panicked: counters.panicked.load(Ordering::Relaxed),
        pending: counters.pending.load(Ordering::SeqCst),
    }
}

/// Receiving half; runs queued work one item at a time.
pub struct WorkQueueWorker {
    rx: mpsc::Receiver<DeferredWork>,
    counters: Arc<WorkCounters>,
}

impl WorkQueueWorker {
    pub fn spawn(self) -> WorkerHandle {
        let (stop, stop_rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);
        let task = tokio::spawn(self.run(stop_rx));
        WorkerHandle {
            stop: Some(stop),
            task,
            counters,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.execute(job).await,
                    None => return,
                },
                _ = &mut stop => break,
            }
        }
        // Stop accepting, then finish what is already queued.
        self.rx.close();
        while let Some(job) = self.rx.recv().await {
            self.execute(job).await;
        }
    }

    async fn execute(&self, job: DeferredWork) {
        let result = AssertUnwindSafe(job).catch_unwind().await;
        self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Deferred work panicked");
            }
        }
    }
}

/// Owner of the running worker task.
pub struct WorkerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    counters: Arc<WorkCounters>,
}

impl WorkerHandle {
    /// Stop accepting work and wait up to `grace` for the queue to empty.
    /// Returns the number of items abandoned.
    pub async fn drain(mut self, grace: Duration) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => 0,
            Err(_) => {
                self.task.abort();
                let _ = (&mut self.task).await;
                let abandoned = self.counters.pending.load(Ordering::SeqCst) as u64;
                tracing::warn!(abandoned, "Deferred work abandoned at shutdown");
                abandoned
            }
        }
    }

    pub fn stats(&self) -> WorkQueueStats {
        stats(&self.counters)
    }
}
