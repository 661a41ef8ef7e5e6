//! In-process pub/sub bus.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryBus`] sees the
//! same channels, which lets several agents share one process (tests,
//! single-host deployments). The bus can be taken offline to simulate a
//! broker outage: all subscriptions end and publishes fail until it comes
//! back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{RawMessage, Transport};
use crate::NetworkError;

const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    client: u64,
    tx: mpsc::Sender<RawMessage>,
}

struct BusInner {
    online: bool,
    channels: HashMap<String, Vec<Subscriber>>,
}

/// Shared in-process broker.
pub struct MemoryBus {
    inner: Mutex<BusInner>,
    next_client: AtomicU64,
    delivered: AtomicU64,
    overflowed: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                online: true,
                channels: HashMap::new(),
            }),
            next_client: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        })
    }

    /// Create a client handle bound to this bus.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            bus: Arc::clone(self),
            client: self.next_client.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    /// Take the bus offline or bring it back.
    ///
    /// Going offline drops every subscription; clients must reconnect and
    /// resubscribe once the bus is online again.
    pub async fn set_online(&self, online: bool) {
        let mut inner = self.inner.lock().await;
        inner.online = online;
        if !online {
            inner.channels.clear();
        }
        tracing::debug!(online, "Memory bus availability changed");
    }

    pub async fn is_online(&self) -> bool {
        self.inner.lock().await.online
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .await
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Messages handed to subscribers so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because a subscriber's queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

/// One client's view of a [`MemoryBus`].
pub struct MemoryTransport {
    bus: Arc<MemoryBus>,
    client: u64,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), NetworkError> {
        if !self.bus.is_online().await {
            return Err(NetworkError::Connection("memory bus is offline".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, channel: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NetworkError::Connection("not connected".into()));
        }
        let mut inner = self.bus.inner.lock().await;
        if !inner.online {
            return Err(NetworkError::Connection("memory bus is offline".into()));
        }
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|sub| {
                let message = RawMessage {
                    channel: channel.to_string(),
                    data: data.clone(),
                };
                match sub.tx.try_send(message) {
                    Ok(()) => {
                        self.bus.delivered.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.bus.overflowed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(channel, client = sub.client, "Subscriber queue full, message dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<RawMessage>, NetworkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NetworkError::Connection("not connected".into()));
        }
        let mut inner = self.bus.inner.lock().await;
        if !inner.online {
            return Err(NetworkError::Connection("memory bus is offline".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                client: self.client,
                tx,
            });
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.bus.is_online().await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut inner = self.bus.inner.lock().await;
        for subscribers in inner.channels.values_mut() {
            subscribers.retain(|sub| sub.client != self.client);
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
