//! Gossipsub transport over TCP + QUIC + Noise + Yamux.
//!
//! The libp2p swarm is owned by a host task; [`GossipTransport`] talks to it
//! over a command channel. Each pub/sub channel maps to one gossipsub topic of
//! the same name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, mdns, noise, tcp, yamux, Multiaddr, Swarm};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::behaviour::{BehaviourConfig, MeshBehaviour, MeshBehaviourEvent};
use crate::transport::{RawMessage, Transport};
use crate::NetworkError;

const COMMAND_CAPACITY: usize = 256;
const SUBSCRIBER_CAPACITY: usize = 256;

/// Configuration for the gossip transport.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Multiaddress to listen on.
    pub listen_addr: String,
    /// Peers dialed on every (re)connect.
    pub bootstrap_peers: Vec<String>,
    /// How long an idle connection stays open before being closed.
    pub idle_connection_timeout: Duration,
    pub behaviour: BehaviourConfig,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/0".to_string(),
            bootstrap_peers: Vec::new(),
            idle_connection_timeout: Duration::from_secs(60),
            behaviour: BehaviourConfig::default(),
        }
    }
}

/// Build a libp2p swarm with a fresh identity.
pub fn build_swarm(config: &GossipConfig) -> Result<Swarm<MeshBehaviour>, NetworkError> {
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    build_swarm_with_keypair(keypair, config)
}

/// Build a swarm with an existing identity keypair.
pub fn build_swarm_with_keypair(
    keypair: libp2p::identity::Keypair,
    config: &GossipConfig,
) -> Result<Swarm<MeshBehaviour>, NetworkError> {
    let behaviour_config = config.behaviour.clone();
    let idle = config.idle_connection_timeout;

    let with_tcp = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Connection(format!("cannot set up tcp/noise/yamux stack: {e}")))?;

    let swarm = with_tcp
        .with_quic()
        .with_behaviour(|key| {
            MeshBehaviour::new(key, &behaviour_config)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .map_err(|e| NetworkError::Behaviour(format!("mesh behaviour rejected its config: {e}")))?
        .with_swarm_config(|swarm_config| swarm_config.with_idle_connection_timeout(idle))
        .build();

    Ok(swarm)
}

enum Command {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Subscribe {
        topic: String,
        sink: mpsc::Sender<RawMessage>,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Shutdown,
}

struct TopicSinks {
    name: String,
    sinks: Vec<mpsc::Sender<RawMessage>>,
}

/// Owns the swarm and drives it until shut down.
struct GossipHost {
    swarm: Swarm<MeshBehaviour>,
    commands: mpsc::Receiver<Command>,
    topics: HashMap<gossipsub::TopicHash, TopicSinks>,
    peers: Arc<AtomicUsize>,
}

impl GossipHost {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
        tracing::debug!("Gossip host stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(topic), data);
                let outcome = match result {
                    Ok(_) | Err(gossipsub::PublishError::Duplicate) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => Err(NetworkError::NoPeers),
                    Err(e) => Err(NetworkError::Publish(e.to_string())),
                };
                let _ = reply.send(outcome);
            }
            Command::Subscribe { topic, sink, reply } => {
                let ident = gossipsub::IdentTopic::new(topic.clone());
                let outcome = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&ident)
                    .map(|_| ())
                    .map_err(|e| NetworkError::Subscribe(e.to_string()));
                if outcome.is_ok() {
                    self.topics
                        .entry(ident.hash())
                        .or_insert_with(|| TopicSinks {
                            name: topic,
                            sinks: Vec::new(),
                        })
                        .sinks
                        .push(sink);
                }
                let _ = reply.send(outcome);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                let Some(entry) = self.topics.get_mut(&message.topic) else {
                    return;
                };
                let channel = entry.name.clone();
                entry.sinks.retain(|sink| {
                    let raw = RawMessage {
                        channel: channel.clone(),
                        data: message.data.clone(),
                    };
                    match sink.try_send(raw) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(channel = %channel, "Subscriber queue full, gossip message dropped");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    }
                });
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, addr) in list {
                    tracing::debug!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer_id, _) in list {
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .remove_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(addr = %address, "Gossip transport listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "Peer connected");
                self.peers
                    .store(self.swarm.connected_peers().count(), Ordering::Relaxed);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "Peer disconnected");
                self.peers
                    .store(self.swarm.connected_peers().count(), Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

struct HostLink {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl HostLink {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed()
    }
}

/// [`Transport`] backed by a libp2p gossipsub swarm.
pub struct GossipTransport {
    config: GossipConfig,
    link: Mutex<Option<HostLink>>,
    peers: Arc<AtomicUsize>,
}

impl GossipTransport {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            peers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of currently connected libp2p peers.
    pub fn connected_peers(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    fn start_host(&self) -> Result<HostLink, NetworkError> {
        let mut swarm = build_swarm(&self.config)?;

        let listen_addr: Multiaddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| NetworkError::Connection(format!("invalid listen address: {e}")))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::Connection(format!("listen failed: {e}")))?;

        for peer in &self.config.bootstrap_peers {
            match peer.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr) {
                        tracing::warn!(peer = %peer, error = %e, "Failed to dial bootstrap peer");
                    }
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Invalid bootstrap address"),
            }
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let host = GossipHost {
            swarm,
            commands: command_rx,
            topics: HashMap::new(),
            peers: Arc::clone(&self.peers),
        };
        let task = tokio::spawn(host.run());
        Ok(HostLink { commands, task })
    }

    async fn command_sender(&self) -> Result<mpsc::Sender<Command>, NetworkError> {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) if link.is_alive() => Ok(link.commands.clone()),
            _ => Err(NetworkError::Connection("gossip host not running".into())),
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), NetworkError>>) -> Command,
    ) -> Result<(), NetworkError> {
        let sender = self.command_sender().await?;
        let (reply, response) = oneshot::channel();
        sender
            .send(build(reply))
            .await
            .map_err(|_| NetworkError::Connection("gossip host stopped".into()))?;
        response
            .await
            .map_err(|_| NetworkError::Connection("gossip host dropped request".into()))?
    }
}

#[async_trait]
impl Transport for GossipTransport {
    async fn connect(&self) -> Result<(), NetworkError> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(HostLink::is_alive) {
            return Ok(());
        }
        *link = Some(self.start_host()?);
        Ok(())
    }

    async fn publish(&self, channel: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        let topic = channel.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<RawMessage>, NetworkError> {
        let (sink, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let topic = channel.to_string();
        self.request(|reply| Command::Subscribe { topic, sink, reply })
            .await?;
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(HostLink::is_alive)
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.commands.send(Command::Shutdown).await;
            if tokio::time::timeout(Duration::from_secs(2), link.task)
                .await
                .is_err()
            {
                tracing::warn!("Gossip host did not stop in time");
            }
        }
        self.peers.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "gossip"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_swarm_builds_with_generated_identity() {
        let mut config = GossipConfig::default();
        config.behaviour.mdns_enabled = false;
        let swarm = build_swarm(&config).unwrap();
        assert_eq!(swarm.connected_peers().count(), 0);
    }
}
