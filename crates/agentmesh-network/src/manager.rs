//! Connection lifecycle over an unreliable [`Transport`].
//!
//! The manager owns the link state for one agent process:
//!
//! - the initial connection is retried a bounded number of times;
//! - once up, any link loss starts a background reconnect loop with
//!   exponential backoff that runs until the link is back or the manager is
//!   closed;
//! - publishes made while the link is down go into a bounded FIFO outbox that
//!   is replayed before the link is declared up again. Overflow drops the
//!   oldest entry and counts it;
//! - a publish with no subscribed peers leaves the link up and is counted as
//!   unheard rather than buffered;
//! - subscriptions re-subscribe after every reconnect. Messages other agents
//!   published during the outage are not recovered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::transport::{RawMessage, Transport};
use crate::NetworkError;

/// Tunables for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Attempts made by [`ConnectionManager::connect`] before giving up.
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    /// Ceiling for the reconnect delay.
    pub backoff_max: Duration,
    /// Outbound messages held while disconnected.
    pub buffer_capacity: usize,
    /// Queue depth between the transport and each [`Subscription`].
    pub subscription_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
            buffer_capacity: 100,
            subscription_capacity: 256,
        }
    }
}

/// Result of a successful [`ConnectionManager::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport.
    Sent,
    /// Link is down; held in the outbox for replay.
    Buffered,
    /// Link is up but nobody was listening; not retained.
    Unheard,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    unheard: AtomicU64,
    buffered: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    publish_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    subscription_restarts: AtomicU64,
    abandoned: AtomicU64,
}

/// Point-in-time copy of the manager's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub published: u64,
    /// Publishes accepted while no peer was subscribed.
    pub unheard: u64,
    pub buffered: u64,
    pub replayed: u64,
    /// Buffered messages evicted by outbox overflow.
    pub dropped: u64,
    pub publish_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub subscription_restarts: u64,
    /// Buffered messages still pending when the manager was closed.
    pub abandoned: u64,
}

/// Health snapshot reported by [`ConnectionManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub transport: &'static str,
    pub connected: bool,
    pub transport_healthy: bool,
    pub reconnecting: bool,
    pub outbox_len: usize,
    pub stats: ConnectionStats,
}

struct LinkState {
    connected: bool,
    outbox: VecDeque<(String, Vec<u8>)>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state: Mutex<LinkState>,
    counters: Counters,
    /// Bumped after every successful reconnect (and on close) so that
    /// subscription pumps know when to re-subscribe.
    generation: watch::Sender<u64>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Connect `transport`, retrying up to `config.connect_attempts` times.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, NetworkError> {
        let attempts = config.connect_attempts.max(1);
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match transport.connect().await {
                Ok(()) => {
                    tracing::info!(transport = transport.name(), attempt, "Transport connected");
                    let (generation, _) = watch::channel(0);
                    return Ok(Arc::new(Self {
                        transport,
                        config,
                        state: Mutex::new(LinkState {
                            connected: true,
                            outbox: VecDeque::new(),
                        }),
                        counters: Counters::default(),
                        generation,
                        reconnecting: AtomicBool::new(false),
                        closed: AtomicBool::new(false),
                    }));
                }
                Err(e) => {
                    tracing::warn!(
                        transport = transport.name(),
                        attempt,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| NetworkError::Connection("no connection attempt made".into())))
    }

    /// Publish `data` on `channel`, buffering it if the link is down.
    ///
    /// Only non-link send failures are returned as errors; they are counted
    /// and the message is not retried.
    pub async fn publish(
        self: &Arc<Self>,
        channel: &str,
        data: Vec<u8>,
    ) -> Result<PublishOutcome, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let generation = *self.generation.borrow();
        let mut state = self.state.lock().await;
        if !state.connected {
            self.enqueue(&mut state, channel, data);
            drop(state);
            self.spawn_reconnect();
            return Ok(PublishOutcome::Buffered);
        }

        match self.transport.publish(channel, data.clone()).await {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(PublishOutcome::Sent)
            }
            Err(NetworkError::NoPeers) => {
                self.counters.unheard.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel, "No peers subscribed, message not delivered");
                Ok(PublishOutcome::Unheard)
            }
            Err(e) if e.is_link_failure() => {
                tracing::warn!(channel, error = %e, "Link lost during publish, buffering");
                self.enqueue(&mut state, channel, data);
                if *self.generation.borrow() == generation {
                    state.connected = false;
                }
                drop(state);
                self.spawn_reconnect();
                Ok(PublishOutcome::Buffered)
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Subscribe to `channel`. The returned stream survives reconnects.
    pub async fn subscribe(self: &Arc<Self>, channel: &str) -> Result<Subscription, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let generation = *self.generation.borrow();
        let initial = match self.transport.subscribe(channel).await {
            Ok(rx) => Some(rx),
            Err(e) if e.is_link_failure() => {
                tracing::warn!(channel, error = %e, "Subscribe deferred until reconnect");
                self.link_lost(generation).await;
                None
            }
            Err(e) => return Err(e),
        };

        let (tx, rx) = mpsc::channel(self.config.subscription_capacity.max(1));
        let task = tokio::spawn(pump(
            Arc::clone(self),
            channel.to_string(),
            initial,
            generation,
            tx,
        ));

        Ok(Subscription {
            channel: channel.to_string(),
            rx,
            task,
        })
    }

    pub async fn health_check(&self) -> ConnectionHealth {
        let (connected, outbox_len) = {
            let state = self.state.lock().await;
            (state.connected, state.outbox.len())
        };
        ConnectionHealth {
            transport: self.transport.name(),
            connected,
            transport_healthy: !self.is_closed() && self.transport.health_check().await,
            reconnecting: self.reconnecting.load(Ordering::SeqCst),
            outbox_len,
            stats: self.stats(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        !self.is_closed() && self.state.lock().await.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        let c = &self.counters;
        ConnectionStats {
            published: c.published.load(Ordering::Relaxed),
            unheard: c.unheard.load(Ordering::Relaxed),
            buffered: c.buffered.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            subscription_restarts: c.subscription_restarts.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Close the connection. Returns the number of buffered messages that
    /// were abandoned.
    pub async fn close(&self) -> u64 {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let abandoned = {
            let mut state = self.state.lock().await;
            state.connected = false;
            let n = state.outbox.len() as u64;
            state.outbox.clear();
            n
        };
        if abandoned > 0 {
            self.counters.abandoned.fetch_add(abandoned, Ordering::Relaxed);
            tracing::warn!(abandoned, "Closing connection with unsent buffered messages");
        }
        self.transport.disconnect().await;
        self.generation.send_modify(|g| *g += 1);
        tracing::info!(transport = self.transport.name(), "Connection closed");
        abandoned
    }

    fn enqueue(&self, state: &mut LinkState, channel: &str, data: Vec<u8>) {
        let capacity = self.config.buffer_capacity;
        if capacity == 0 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(channel, "Outbound buffer disabled, message dropped");
            return;
        }
        while state.outbox.len() >= capacity {
            if let Some((dropped_channel, _)) = state.outbox.pop_front() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    channel = %dropped_channel,
                    capacity,
                    "Outbound buffer full, dropped oldest message"
                );
            }
        }
        state.outbox.push_back((channel.to_string(), data));
        self.counters.buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the link down if no reconnect has happened since `generation`.
    async fn link_lost(self: &Arc<Self>, generation: u64) {
        if self.is_closed() || *self.generation.borrow() != generation {
            return;
        }
        self.state.lock().await.connected = false;
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.is_closed() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        loop {
            if self.is_closed() {
                break;
            }
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            match self.transport.connect().await {
                Ok(()) => match self.flush_outbox().await {
                    Ok(replayed) => {
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.generation.send_modify(|g| *g += 1);
                        tracing::info!(
                            transport = self.transport.name(),
                            attempts = backoff.attempt() + 1,
                            replayed,
                            "Transport reconnected"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Link lost again while replaying outbox");
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        transport = self.transport.name(),
                        attempt = backoff.attempt() + 1,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
        self.reconnecting.store(false, Ordering::SeqCst);

        // The link may have dropped again between the flush and clearing the flag.
        if !self.is_closed() && !self.state.lock().await.connected {
            self.spawn_reconnect();
        }
    }

    /// Replay the outbox in FIFO order, then declare the link up.
    ///
    /// The state lock is held throughout so new publishes queue behind the
    /// replay instead of overtaking it.
    async fn flush_outbox(&self) -> Result<u64, NetworkError> {
        let mut state = self.state.lock().await;
        let mut replayed = 0;
        while let Some((channel, data)) = state.outbox.front() {
            match self.transport.publish(channel, data.clone()).await {
                Ok(()) => {
                    state.outbox.pop_front();
                    replayed += 1;
                    self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_link_failure() => return Err(e),
                Err(NetworkError::NoPeers) => {
                    state.outbox.pop_front();
                    self.counters.unheard.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Dropping buffered message that failed to replay");
                    state.outbox.pop_front();
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        state.connected = true;
        Ok(replayed)
    }
}

/// A restartable inbound stream for one channel.
///
/// Dropping the subscription stops its background task.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<RawMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Next message, or `None` once the manager is closed.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump(
    manager: Arc<ConnectionManager>,
    channel: String,
    mut current: Option<mpsc::Receiver<RawMessage>>,
    mut generation: u64,
    tx: mpsc::Sender<RawMessage>,
) {
    let mut watcher = manager.generation.subscribe();
    loop {
        if let Some(mut rx) = current.take() {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => {
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => return,
                }
            }
            if manager.is_closed() {
                return;
            }
            tracing::debug!(channel = %channel, "Subscription ended, waiting for reconnect");
            manager.link_lost(generation).await;
        }

        let seen = generation;
        match watcher.wait_for(|g| *g != seen).await {
            Ok(g) => generation = *g,
            Err(_) => return,
        }
        if manager.is_closed() {
            return;
        }

        match manager.transport.subscribe(&channel).await {
            Ok(rx) => {
                manager
                    .counters
                    .subscription_restarts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(channel = %channel, "Re-subscribed after reconnect");
                current = Some(rx);
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Re-subscribe failed");
                manager.link_lost(generation).await;
            }
        }
    }
}
