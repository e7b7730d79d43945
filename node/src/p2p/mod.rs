//! Message delivery
//!
//! Direct sends succeed only if the peer is reachable. Mailbox sends fall back
//! to storing the message until the peer comes online.

pub mod local_network;

use async_trait::async_trait;
use escrow_types::{NodeAddress, PubKeyRing};

use crate::error::DeliveryResult;
use crate::protocol::messages::Envelope;

pub use local_network::LocalNetwork;

/// Where a mailbox message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxOutcome {
    Arrived,
    StoredInMailbox,
}

#[async_trait]
pub trait MessageDelivery: Send + Sync {
    /// Ok means the message arrived
    async fn send_direct(
        &self,
        peer: &NodeAddress,
        peer_key: &PubKeyRing,
        envelope: Envelope,
    ) -> DeliveryResult<()>;

    async fn send_mailbox(
        &self,
        peer: &NodeAddress,
        peer_key: &PubKeyRing,
        envelope: Envelope,
    ) -> DeliveryResult<MailboxOutcome>;

    /// Drop a stored mailbox message once it was acknowledged
    async fn remove_mailbox_message(&self, peer: &NodeAddress, uid: &str) -> DeliveryResult<()>;
}

/// Receiving side of a node
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_direct_message(&self, envelope: Envelope);

    /// Messages held while offline, delivered as one batch
    async fn on_mailbox_messages(&self, envelopes: Vec<Envelope>);
}
