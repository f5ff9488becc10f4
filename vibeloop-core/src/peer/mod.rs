//! Peer Channel Manager
//!
//! Direct, low-latency links between the host and each listener, used only
//! to fan out playback updates. Everything here is best-effort: when a link
//! cannot be negotiated, times out, or closes later, it is dropped quietly
//! and the listener keeps following the session through the document store.

mod loopback;
mod signaling;
mod swarm;

pub use loopback::LoopbackNetwork;
pub use signaling::{SignalEnvelope, SignalLink, SignalingChannel};
pub use swarm::{Libp2pConfig, Libp2pTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::StoreError;
use crate::sync::PeerMessage;

/// Why a peer link could not be used. Never leaves this module's callers
/// as a user-facing error.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Signaling failed: {0}")]
    Signaling(#[from] StoreError),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Negotiation timed out")]
    Timeout,

    #[error("Direct connectivity unavailable")]
    Unavailable,

    #[error("Peer channel closed")]
    Closed,

    #[error("Failed to create transport: {0}")]
    Transport(String),
}

/// An ordered, reliable byte pipe to one remote
#[derive(Debug)]
pub struct PeerChannel {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PeerChannel {
    /// Two connected ends, as if negotiated
    pub fn pair() -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PeerChannel {
                outbound: a_tx,
                inbound: b_rx,
            },
            PeerChannel {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Something that can negotiate a direct channel over a signaling link
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Host side: start negotiation with the listener on the other end of `link`
    async fn offer(&self, link: SignalLink) -> Result<PeerChannel, PeerError>;

    /// Listener side: answer the host's negotiation on `link`
    async fn accept(&self, link: SignalLink) -> Result<PeerChannel, PeerError>;
}

/// Transport for clients with no direct connectivity at all
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTransport;

#[async_trait]
impl PeerTransport for DisabledTransport {
    async fn offer(&self, _link: SignalLink) -> Result<PeerChannel, PeerError> {
        Err(PeerError::Unavailable)
    }

    async fn accept(&self, _link: SignalLink) -> Result<PeerChannel, PeerError> {
        Err(PeerError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offer,
    Accept,
}

/// Per-remote link state
struct PeerLink {
    generation: u64,
    /// Set once negotiation finished
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Links {
    by_remote: HashMap<String, PeerLink>,
    next_generation: u64,
}

/// Owns every peer link of one active session
pub struct PeerChannelManager {
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingChannel,
    negotiation_timeout: Duration,
    links: Arc<Mutex<Links>>,
    inbound_tx: mpsc::UnboundedSender<(String, PeerMessage)>,
}

impl PeerChannelManager {
    /// Create a manager and the receiver of decoded messages from all links
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        signaling: SignalingChannel,
        negotiation_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<(String, PeerMessage)>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            signaling,
            negotiation_timeout,
            links: Arc::new(Mutex::new(Links::default())),
            inbound_tx,
        };
        (manager, inbound_rx)
    }

    /// Host side: negotiate a link with a newly joined listener
    pub fn connect_listener(&self, listener_id: &str) {
        self.open(listener_id, Role::Offer);
    }

    /// Listener side: accept the host's link in the background
    pub fn accept_host(&self, host_id: &str) {
        self.open(host_id, Role::Accept);
    }

    fn open(&self, remote_id: &str, role: Role) {
        if remote_id == self.signaling.local_id() {
            return;
        }

        let mut links = self.links.lock();
        if links.by_remote.contains_key(remote_id) {
            debug!("Peer link with {} already exists", remote_id);
            return;
        }

        let generation = links.next_generation;
        links.next_generation += 1;

        let task = tokio::spawn(run_link(
            self.transport.clone(),
            self.signaling.clone(),
            remote_id.to_string(),
            role,
            self.negotiation_timeout,
            generation,
            self.links.clone(),
            self.inbound_tx.clone(),
        ));

        links.by_remote.insert(
            remote_id.to_string(),
            PeerLink {
                generation,
                outbound: None,
                task,
            },
        );
    }

    /// Send a message over every ready link, returning how many took it
    pub fn broadcast(&self, message: &PeerMessage) -> usize {
        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode peer message: {}", e);
                return 0;
            }
        };

        let mut links = self.links.lock();
        let mut sent = 0;
        let mut dead = Vec::new();
        for (remote, link) in links.by_remote.iter() {
            if let Some(outbound) = &link.outbound {
                if outbound.send(data.clone()).is_ok() {
                    sent += 1;
                } else {
                    dead.push(remote.clone());
                }
            }
        }
        for remote in dead {
            if let Some(link) = links.by_remote.remove(&remote) {
                debug!("Peer link with {} closed, dropping it", remote);
                link.task.abort();
            }
        }
        sent
    }

    /// Tear down the link with one remote
    pub fn disconnect(&self, remote_id: &str) {
        let link = self.links.lock().by_remote.remove(remote_id);
        if let Some(link) = link {
            info!("Closing peer link with {}", remote_id);
            close_link(link);
        }
    }

    /// Tear down every link. Synchronous: no link task survives this call.
    pub fn close_all(&self) {
        let drained: Vec<(String, PeerLink)> = self.links.lock().by_remote.drain().collect();
        if !drained.is_empty() {
            info!("Closing {} peer links", drained.len());
        }
        for (_, link) in drained {
            close_link(link);
        }
    }

    /// Whether a negotiated link with `remote_id` is open
    pub fn is_connected(&self, remote_id: &str) -> bool {
        self.links
            .lock()
            .by_remote
            .get(remote_id)
            .map(|l| l.outbound.is_some())
            .unwrap_or(false)
    }

    /// Number of negotiated links
    pub fn ready_count(&self) -> usize {
        self.links
            .lock()
            .by_remote
            .values()
            .filter(|l| l.outbound.is_some())
            .count()
    }
}

impl Drop for PeerChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn close_link(link: PeerLink) {
    if let Some(outbound) = &link.outbound {
        if let Ok(bye) = PeerMessage::Bye.encode() {
            let _ = outbound.send(bye);
        }
    }
    link.task.abort();
}

#[allow(clippy::too_many_arguments)]
async fn run_link(
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingChannel,
    remote_id: String,
    role: Role,
    negotiation_timeout: Duration,
    generation: u64,
    links: Arc<Mutex<Links>>,
    inbound_tx: mpsc::UnboundedSender<(String, PeerMessage)>,
) {
    let negotiated = async {
        let link = signaling.link(&remote_id)?;
        match role {
            Role::Offer => transport.offer(link).await,
            Role::Accept => transport.accept(link).await,
        }
    };

    let channel = match tokio::time::timeout(negotiation_timeout, negotiated).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            info!("Peer link with {} unavailable ({}), using store updates only", remote_id, e);
            forget(&links, &remote_id, generation);
            return;
        }
        Err(_) => {
            info!(
                "Peer link with {} timed out after {:?}, using store updates only",
                remote_id, negotiation_timeout
            );
            forget(&links, &remote_id, generation);
            return;
        }
    };

    let PeerChannel {
        outbound,
        mut inbound,
    } = channel;

    {
        let mut links = links.lock();
        match links.by_remote.get_mut(&remote_id) {
            Some(link) if link.generation == generation => link.outbound = Some(outbound),
            // Torn down while we were negotiating
            _ => return,
        }
    }
    info!("Peer link with {} ready", remote_id);

    while let Some(bytes) = inbound.recv().await {
        match PeerMessage::decode(&bytes) {
            Some(PeerMessage::Bye) => {
                debug!("Peer {} said bye", remote_id);
                break;
            }
            Some(message) => {
                if inbound_tx.send((remote_id.clone(), message)).is_err() {
                    break;
                }
            }
            None => {}
        }
    }

    info!("Peer link with {} closed", remote_id);
    forget(&links, &remote_id, generation);
}

/// Drop our entry for `remote_id` unless a newer link replaced it
fn forget(links: &Mutex<Links>, remote_id: &str, generation: u64) {
    let mut links = links.lock();
    if links
        .by_remote
        .get(remote_id)
        .map(|l| l.generation == generation)
        .unwrap_or(false)
    {
        links.by_remote.remove(remote_id);
    }
}
