//! In-process network connecting the nodes of a simulation

use async_trait::async_trait;
use escrow_types::{NodeAddress, PubKeyRing};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use super::{InboundHandler, MailboxOutcome, MessageDelivery};
use crate::error::{DeliveryError, DeliveryResult};
use crate::protocol::messages::Envelope;

/// Matches in-flight messages by recipient and content
pub type DropFilter = Box<dyn Fn(&NodeAddress, &Envelope) -> bool + Send + Sync>;

struct Peer {
    handler: Weak<dyn InboundHandler>,
    pub_key_ring: PubKeyRing,
    online: bool,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<NodeAddress, Peer>,
    mailboxes: HashMap<NodeAddress, Vec<Envelope>>,
    drop_filter: Option<DropFilter>,
    unreachable_filter: Option<DropFilter>,
    dropped: usize,
}

#[derive(Default)]
pub struct LocalNetwork {
    state: Mutex<NetworkState>,
}

enum Route {
    Deliver(Arc<dyn InboundHandler>),
    Offline,
    Dropped,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        address: NodeAddress,
        pub_key_ring: PubKeyRing,
        handler: Weak<dyn InboundHandler>,
    ) {
        info!(address = %address, "Node joined local network");
        self.state().peers.insert(
            address,
            Peer {
                handler,
                pub_key_ring,
                online: true,
            },
        );
    }

    /// Take a node offline or bring it back. Coming online delivers its mailbox.
    pub fn set_online(&self, address: &NodeAddress, online: bool) {
        let (handler, batch) = {
            let mut state = self.state();
            let handler = match state.peers.get_mut(address) {
                Some(peer) => {
                    peer.online = online;
                    peer.handler.upgrade()
                }
                None => return,
            };
            if !online {
                info!(address = %address, "Node went offline");
                return;
            }
            let batch = state.mailboxes.remove(address).unwrap_or_default();
            (handler, batch)
        };

        info!(address = %address, mailbox = batch.len(), "Node came online");
        if let (Some(handler), false) = (handler, batch.is_empty()) {
            tokio::spawn(async move {
                handler.on_mailbox_messages(batch).await;
            });
        }
    }

    pub fn set_drop_filter(&self, filter: DropFilter) {
        self.state().drop_filter = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        self.state().drop_filter = None;
    }

    /// Matching messages find their recipient offline while it stays online
    /// for everything else
    pub fn set_unreachable_filter(&self, filter: DropFilter) {
        self.state().unreachable_filter = Some(filter);
    }

    pub fn dropped_count(&self) -> usize {
        self.state().dropped
    }

    pub fn mailbox_len(&self, address: &NodeAddress) -> usize {
        self.state().mailboxes.get(address).map_or(0, Vec::len)
    }

    fn route(
        &self,
        peer: &NodeAddress,
        peer_key: &PubKeyRing,
        envelope: &Envelope,
    ) -> DeliveryResult<Route> {
        let mut state = self.state();
        let dropped = state
            .drop_filter
            .as_ref()
            .map(|filter| filter(peer, envelope))
            .unwrap_or(false);
        let unreachable = state
            .unreachable_filter
            .as_ref()
            .map(|filter| filter(peer, envelope))
            .unwrap_or(false);

        let entry = state
            .peers
            .get(peer)
            .ok_or_else(|| DeliveryError::UnknownPeer(peer.clone()))?;
        if &entry.pub_key_ring != peer_key {
            return Err(DeliveryError::KeyMismatch(peer.clone()));
        }
        if !entry.online || unreachable {
            return Ok(Route::Offline);
        }
        let handler = entry.handler.upgrade();

        if dropped {
            state.dropped += 1;
            debug!(
                to = %peer,
                message = envelope.message.class_name(),
                "Message lost in transit"
            );
            return Ok(Route::Dropped);
        }
        match handler {
            Some(handler) => Ok(Route::Deliver(handler)),
            None => Ok(Route::Offline),
        }
    }

    fn deliver(handler: Arc<dyn InboundHandler>, envelope: Envelope) {
        tokio::spawn(async move {
            handler.on_direct_message(envelope).await;
        });
    }
}

#[async_trait]
impl MessageDelivery for LocalNetwork {
    async fn send_direct(
        &self,
        peer: &NodeAddress,
        peer_key: &PubKeyRing,
        envelope: Envelope,
    ) -> DeliveryResult<()> {
        match self.route(peer, peer_key, &envelope)? {
            Route::Deliver(handler) => {
                Self::deliver(handler, envelope);
                Ok(())
            }
            Route::Dropped => Ok(()),
            Route::Offline => Err(DeliveryError::PeerOffline(peer.clone())),
        }
    }

    async fn send_mailbox(
        &self,
        peer: &NodeAddress,
        peer_key: &PubKeyRing,
        envelope: Envelope,
    ) -> DeliveryResult<MailboxOutcome> {
        match self.route(peer, peer_key, &envelope)? {
            Route::Deliver(handler) => {
                Self::deliver(handler, envelope);
                Ok(MailboxOutcome::Arrived)
            }
            Route::Dropped => Ok(MailboxOutcome::Arrived),
            Route::Offline => {
                debug!(
                    to = %peer,
                    message = envelope.message.class_name(),
                    "Peer offline, storing in mailbox"
                );
                self.state()
                    .mailboxes
                    .entry(peer.clone())
                    .or_default()
                    .push(envelope);
                Ok(MailboxOutcome::StoredInMailbox)
            }
        }
    }

    async fn remove_mailbox_message(&self, peer: &NodeAddress, uid: &str) -> DeliveryResult<()> {
        if let Some(mailbox) = self.state().mailboxes.get_mut(peer) {
            let before = mailbox.len();
            mailbox.retain(|e| e.message.uid() != uid);
            if mailbox.len() != before {
                warn!(to = %peer, "Removed acknowledged message still held in mailbox");
            }
        }
        Ok(())
    }
}
