//! libp2p transport
//!
//! One swarm per client, running in a background task:
//! - TCP + QUIC transports with noise and yamux
//! - identify and ping for connection upkeep
//! - gossipsub, with one private topic per host/listener link
//!
//! Negotiation exchanges peer ids, listen addresses, and the link topic over
//! the signaling link. The link is ready once the remote has subscribed to
//! the topic; from then on every published payload reaches it in order.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, noise, ping,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{PeerChannel, PeerError, PeerTransport, SignalLink};

const PROTOCOL_VERSION: &str = "/vibeloop/1.0.0";

/// Transport configuration
#[derive(Debug, Clone)]
pub struct Libp2pConfig {
    /// Addresses to listen on
    pub listen_addresses: Vec<String>,
    /// How long an idle connection is kept open
    pub idle_connection_timeout: Duration,
    /// Ping interval for keep-alive
    pub ping_interval: Duration,
}

impl Default for Libp2pConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
            ],
            idle_connection_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(15),
        }
    }
}

#[derive(NetworkBehaviour)]
struct LinkBehaviour {
    /// Keep-alive
    ping: ping::Behaviour,
    /// Peer identification
    identify: identify::Behaviour,
    /// Link topics
    gossipsub: gossipsub::Behaviour,
}

/// What the host publishes to start negotiation
#[derive(Debug, Serialize, Deserialize)]
struct LinkOffer {
    peer_id: String,
    addresses: Vec<String>,
    topic: String,
}

/// The listener's reply
#[derive(Debug, Serialize, Deserialize)]
struct LinkAnswer {
    peer_id: String,
    addresses: Vec<String>,
}

/// Commands sent to the swarm task
enum SwarmCommand {
    /// Report our listen addresses once we have at least one
    ListenAddresses {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Connect to a peer at the given addresses
    Dial {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
    },
    /// Subscribe to a link topic shared with `remote`
    Open {
        topic: String,
        remote: PeerId,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        ready: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
    Close {
        topic: String,
    },
}

/// Per-topic state inside the swarm task
struct TopicLink {
    topic: gossipsub::IdentTopic,
    remote: PeerId,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    ready: Option<oneshot::Sender<()>>,
}

/// Direct peer channels over libp2p
#[derive(Clone)]
pub struct Libp2pTransport {
    command_tx: mpsc::UnboundedSender<SwarmCommand>,
    local_peer_id: PeerId,
}

impl Libp2pTransport {
    /// Build the swarm and start it in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Libp2pConfig) -> Result<Self, PeerError> {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        let mut swarm = create_swarm(keypair, &config)?;
        for addr in &config.listen_addresses {
            let parsed: Multiaddr = match addr.parse() {
                Ok(a) => a,
                Err(e) => {
                    warn!("Invalid listen address {}: {}", addr, e);
                    continue;
                }
            };
            match swarm.listen_on(parsed) {
                Ok(id) => info!("Listener started on {}: {:?}", addr, id),
                Err(e) => warn!("Failed to listen on {}: {:?}", addr, e),
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = SwarmTask {
            local_peer_id,
            listen_addresses: Vec::new(),
            waiting_for_addresses: Vec::new(),
            links: HashMap::new(),
        };
        tokio::spawn(task.run(swarm, command_rx));

        Ok(Self {
            command_tx,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> String {
        self.local_peer_id.to_string()
    }

    fn send(&self, command: SwarmCommand) -> Result<(), PeerError> {
        self.command_tx
            .send(command)
            .map_err(|_| PeerError::Transport("Network task closed".to_string()))
    }

    async fn listen_addresses(&self) -> Result<Vec<String>, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(SwarmCommand::ListenAddresses { reply })?;
        let addresses = rx.await.map_err(|_| PeerError::Closed)?;
        Ok(addresses.iter().map(|a| a.to_string()).collect())
    }

    fn dial(&self, peer: PeerId, addresses: &[String]) -> Result<(), PeerError> {
        let addresses: Vec<Multiaddr> = addresses.iter().filter_map(|a| a.parse().ok()).collect();
        if addresses.is_empty() {
            return Err(PeerError::Negotiation(format!("no usable addresses for {}", peer)));
        }
        self.send(SwarmCommand::Dial { peer, addresses })
    }

    /// Subscribe to the link topic and wait until the remote is on it too
    async fn open(&self, topic: String, remote: PeerId) -> Result<PeerChannel, PeerError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        self.send(SwarmCommand::Open {
            topic: topic.clone(),
            remote,
            inbound: inbound_tx,
            ready: ready_tx,
        })?;
        ready_rx.await.map_err(|_| PeerError::Closed)?;

        // Bridge outbound bytes onto publish commands; closing the channel
        // leaves the topic
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if command_tx
                    .send(SwarmCommand::Publish {
                        topic: topic.clone(),
                        data,
                    })
                    .is_err()
                {
                    return;
                }
            }
            let _ = command_tx.send(SwarmCommand::Close { topic });
        });

        Ok(PeerChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn parse_peer_id(raw: &str) -> Result<PeerId, PeerError> {
    raw.parse()
        .map_err(|e| PeerError::Negotiation(format!("invalid peer id {}: {}", raw, e)))
}

#[async_trait]
impl PeerTransport for Libp2pTransport {
    async fn offer(&self, mut link: SignalLink) -> Result<PeerChannel, PeerError> {
        let topic = format!(
            "vibeloop-link-{}-{:016x}",
            link.remote_id(),
            rand::thread_rng().gen::<u64>()
        );
        let offer = LinkOffer {
            peer_id: self.local_peer_id.to_string(),
            addresses: self.listen_addresses().await?,
            topic: topic.clone(),
        };
        let payload =
            serde_json::to_string(&offer).map_err(|e| PeerError::Negotiation(e.to_string()))?;
        info!("Offering peer link to {} on {}", link.remote_id(), topic);
        link.send(&payload).await?;

        let answer = loop {
            let payload = link.recv().await.ok_or(PeerError::Closed)?;
            match serde_json::from_str::<LinkAnswer>(&payload) {
                Ok(answer) => break answer,
                Err(e) => debug!("Ignoring signaling payload from {}: {}", link.remote_id(), e),
            }
        };

        let remote = parse_peer_id(&answer.peer_id)?;
        // Either side may be the one that can dial; try both directions
        if let Err(e) = self.dial(remote, &answer.addresses) {
            debug!("Not dialing {}: {}", remote, e);
        }
        self.open(topic, remote).await
    }

    async fn accept(&self, mut link: SignalLink) -> Result<PeerChannel, PeerError> {
        let offer = loop {
            let payload = link.recv().await.ok_or(PeerError::Closed)?;
            match serde_json::from_str::<LinkOffer>(&payload) {
                Ok(offer) => break offer,
                Err(e) => debug!("Ignoring signaling payload from {}: {}", link.remote_id(), e),
            }
        };
        let remote = parse_peer_id(&offer.peer_id)?;

        let answer = LinkAnswer {
            peer_id: self.local_peer_id.to_string(),
            addresses: self.listen_addresses().await?,
        };
        let payload =
            serde_json::to_string(&answer).map_err(|e| PeerError::Negotiation(e.to_string()))?;
        link.send(&payload).await?;

        info!("Accepting peer link from {} on {}", link.remote_id(), offer.topic);
        self.dial(remote, &offer.addresses)?;
        self.open(offer.topic, remote).await
    }
}

/// Create the libp2p swarm
///
/// Transport chain: TCP -> QUIC -> DNS
fn create_swarm(
    keypair: identity::Keypair,
    config: &Libp2pConfig,
) -> Result<Swarm<LinkBehaviour>, PeerError> {
    let ping_interval = config.ping_interval;

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| PeerError::Transport(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| PeerError::Transport(e.to_string()))?
        .with_behaviour(|keypair| {
            let ping = ping::Behaviour::new(
                ping::Config::new()
                    .with_interval(ping_interval)
                    .with_timeout(ping_interval + Duration::from_secs(5)),
            );

            // Links are one-to-one: explicit peers and flood publishing do
            // the delivery, so the mesh may stay empty
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .mesh_outbound_min(0)
                .mesh_n_low(1)
                .mesh_n(2)
                .mesh_n_high(4)
                .gossip_lazy(2)
                .build()
                .map_err(|e| e.to_string())?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                gossipsub_config,
            )
            .map_err(|e| e.to_string())?;

            let identify = identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.into(),
                keypair.public(),
            ));

            Ok(LinkBehaviour {
                ping,
                identify,
                gossipsub,
            })
        })
        .map_err(|e| PeerError::Transport(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
        .build();

    Ok(swarm)
}

struct SwarmTask {
    local_peer_id: PeerId,
    listen_addresses: Vec<Multiaddr>,
    waiting_for_addresses: Vec<oneshot::Sender<Vec<Multiaddr>>>,
    links: HashMap<gossipsub::TopicHash, TopicLink>,
}

impl SwarmTask {
    async fn run(
        mut self,
        mut swarm: Swarm<LinkBehaviour>,
        mut command_rx: mpsc::UnboundedReceiver<SwarmCommand>,
    ) {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event);
                }
                command = command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(&mut swarm, command),
                        None => {
                            info!("Network shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, swarm: &mut Swarm<LinkBehaviour>, command: SwarmCommand) {
        match command {
            SwarmCommand::ListenAddresses { reply } => {
                if self.listen_addresses.is_empty() {
                    self.waiting_for_addresses.push(reply);
                } else {
                    let _ = reply.send(self.listen_addresses.clone());
                }
            }
            SwarmCommand::Dial { peer, addresses } => {
                if swarm.is_connected(&peer) {
                    return;
                }
                info!("Dialing {} at {} addresses", peer, addresses.len());
                let opts = DialOpts::peer_id(peer).addresses(addresses).build();
                if let Err(e) = swarm.dial(opts) {
                    warn!("Failed to dial {}: {}", peer, e);
                }
            }
            SwarmCommand::Open {
                topic,
                remote,
                inbound,
                ready,
            } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                    warn!("Failed to subscribe to {}: {}", topic, e);
                    return;
                }
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&remote);

                let hash = topic.hash();
                let already_there = swarm
                    .behaviour()
                    .gossipsub
                    .all_peers()
                    .any(|(peer, topics)| *peer == remote && topics.contains(&&hash));

                let mut link = TopicLink {
                    topic,
                    remote,
                    inbound,
                    ready: Some(ready),
                };
                if already_there {
                    link.mark_ready();
                }
                self.links.insert(hash, link);
            }
            SwarmCommand::Publish { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    debug!("Publish error (remote may be gone): {}", e);
                }
            }
            SwarmCommand::Close { topic } => {
                let hash = gossipsub::IdentTopic::new(topic).hash();
                self.close_link(swarm, &hash);
            }
        }
    }

    fn close_link(&mut self, swarm: &mut Swarm<LinkBehaviour>, hash: &gossipsub::TopicHash) {
        if let Some(link) = self.links.remove(hash) {
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&link.topic);
            debug!("Left link topic {}", link.topic);
        }
    }

    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<LinkBehaviour>,
        event: SwarmEvent<LinkBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}/p2p/{}", address, self.local_peer_id);
                self.listen_addresses.push(address);
                for reply in self.waiting_for_addresses.drain(..) {
                    let _ = reply.send(self.listen_addresses.clone());
                }
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!("Connection established with {} via {:?}", peer_id, endpoint);
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                debug!("Connection closed with {}", peer_id);
                if num_established == 0 {
                    let gone: Vec<gossipsub::TopicHash> = self
                        .links
                        .iter()
                        .filter(|(_, link)| link.remote == peer_id)
                        .map(|(hash, _)| hash.clone())
                        .collect();
                    for hash in gone {
                        self.close_link(swarm, &hash);
                    }
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    warn!("Failed to connect to {}: {}", peer, error);
                } else {
                    warn!("Outgoing connection error: {}", error);
                }
            }

            SwarmEvent::Behaviour(LinkBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                if let Some(link) = self.links.get_mut(&topic) {
                    if link.remote == peer_id {
                        info!("Peer {} joined link topic {}", peer_id, link.topic);
                        link.mark_ready();
                    }
                }
            }

            SwarmEvent::Behaviour(LinkBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                let remote_left = self
                    .links
                    .get(&topic)
                    .map(|link| link.remote == peer_id && link.ready.is_none())
                    .unwrap_or(false);
                if remote_left {
                    info!("Peer {} left link topic", peer_id);
                    self.close_link(swarm, &topic);
                }
            }

            SwarmEvent::Behaviour(LinkBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let Some(link) = self.links.get(&message.topic) else {
                    return;
                };
                if message.source != Some(link.remote) {
                    debug!("Ignoring link message relayed by {}", propagation_source);
                    return;
                }
                if link.inbound.send(message.data).is_err() {
                    let hash = message.topic.clone();
                    self.close_link(swarm, &hash);
                }
            }

            SwarmEvent::Behaviour(LinkBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!("Identified peer {} running {}", peer_id, info.protocol_version);
            }

            _ => {}
        }
    }
}

impl TopicLink {
    fn mark_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_payloads_are_plain_json() {
        let offer = LinkOffer {
            peer_id: "12D3KooW".to_string(),
            addresses: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
            topic: "vibeloop-link-ada-00000000000000ff".to_string(),
        };
        let json = serde_json::to_string(&offer).unwrap();
        let back: LinkOffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, offer.topic);

        // An answer is never mistaken for an offer
        let answer = serde_json::to_string(&LinkAnswer {
            peer_id: "12D3KooW".to_string(),
            addresses: vec![],
        })
        .unwrap();
        assert!(serde_json::from_str::<LinkOffer>(&answer).is_err());
    }

    #[test]
    fn test_default_config_listens_on_tcp_and_quic() {
        let config = Libp2pConfig::default();
        assert!(config.listen_addresses.iter().any(|a| a.contains("/tcp/")));
        assert!(config.listen_addresses.iter().any(|a| a.contains("quic-v1")));
        for addr in &config.listen_addresses {
            assert!(addr.parse::<Multiaddr>().is_ok());
        }
    }

    #[test]
    fn test_bad_peer_id_fails_negotiation() {
        assert!(matches!(parse_peer_id("nope"), Err(PeerError::Negotiation(_))));
        let id = PeerId::random();
        assert_eq!(parse_peer_id(&id.to_string()).unwrap(), id);
    }

    #[tokio::test]
    async fn test_transport_starts_and_reports_addresses() {
        let config = Libp2pConfig {
            listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            ..Default::default()
        };
        let transport = Libp2pTransport::start(config).unwrap();
        let addresses = tokio::time::timeout(Duration::from_secs(5), transport.listen_addresses())
            .await
            .unwrap()
            .unwrap();
        assert!(addresses.iter().all(|a| a.starts_with("/ip4/127.0.0.1/tcp/")));
        assert!(!transport.local_peer_id().is_empty());
    }

    fn localhost() -> Libp2pTransport {
        Libp2pTransport::start(Libp2pConfig {
            listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_link_negotiates_and_carries_payloads() {
        use crate::clock::ManualClock;
        use crate::peer::SignalingChannel;
        use crate::store::{DocumentStore, MemoryStore};
        use std::sync::Arc;

        let (_clock, shared) = ManualClock::shared(1);
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_clock(shared.clone()));
        let host_signals = SignalingChannel::new(store.clone(), "s1", "host", shared.clone());
        let ada_signals = SignalingChannel::new(store, "s1", "ada", shared);

        let host = localhost();
        let ada = localhost();
        let (offered, accepted) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(
                host.offer(host_signals.link("ada").unwrap()),
                ada.accept(ada_signals.link("host").unwrap()),
            )
        })
        .await
        .unwrap();
        let host_end = offered.unwrap();
        let mut ada_end = accepted.unwrap();

        host_end.outbound.send(b"hello".to_vec()).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(10), ada_end.inbound.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some(&b"hello"[..]));
    }
}
