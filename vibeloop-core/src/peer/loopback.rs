//! In-process transport
//!
//! Clients that share a `LoopbackNetwork` can reach each other directly.
//! Negotiation still goes through the signaling link, so everything above
//! the transport behaves as it would over a real network. Blocking the
//! network makes every negotiation fail, like a client behind a firewall
//! that drops all direct traffic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use super::{PeerChannel, PeerError, PeerTransport, SignalLink};

const OFFER_PREFIX: &str = "loopback-offer:";
const ACCEPTED: &str = "loopback-accepted";
const REJECTED: &str = "loopback-rejected";

#[derive(Default)]
struct NetworkState {
    /// Listener ends waiting to be picked up, keyed by offer token
    pending: HashMap<String, PeerChannel>,
    blocked: bool,
}

/// A shared in-process network
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make direct connectivity fail (or work again) for everyone
    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().blocked = blocked;
    }

    /// A transport attached to this network
    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::new(self.clone())
    }

    fn take(&self, token: &str) -> Option<PeerChannel> {
        let mut state = self.state.lock();
        if state.blocked {
            return None;
        }
        state.pending.remove(token)
    }
}

#[async_trait]
impl PeerTransport for LoopbackNetwork {
    async fn offer(&self, mut link: SignalLink) -> Result<PeerChannel, PeerError> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let (ours, theirs) = PeerChannel::pair();
        self.state.lock().pending.insert(token.clone(), theirs);

        let answer: Result<(), PeerError> = async {
            link.send(&format!("{}{}", OFFER_PREFIX, token)).await?;
            match link.recv().await.as_deref() {
                Some(ACCEPTED) => Ok(()),
                Some(REJECTED) => Err(PeerError::Unavailable),
                Some(other) => Err(PeerError::Negotiation(format!("unexpected answer {:?}", other))),
                None => Err(PeerError::Closed),
            }
        }
        .await;

        match answer {
            Ok(()) => {
                debug!("Loopback: {} connected to {}", link.local_id(), link.remote_id());
                Ok(ours)
            }
            Err(e) => {
                self.state.lock().pending.remove(&token);
                Err(e)
            }
        }
    }

    async fn accept(&self, mut link: SignalLink) -> Result<PeerChannel, PeerError> {
        loop {
            let payload = link.recv().await.ok_or(PeerError::Closed)?;
            let Some(token) = payload.strip_prefix(OFFER_PREFIX) else {
                debug!("Loopback: ignoring signaling payload {:?}", payload);
                continue;
            };

            return match self.take(token) {
                Some(channel) => {
                    link.send(ACCEPTED).await?;
                    Ok(channel)
                }
                None => {
                    link.send(REJECTED).await?;
                    Err(PeerError::Unavailable)
                }
            };
        }
    }
}
