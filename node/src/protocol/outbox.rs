//! Sending trade messages and ACKs to peers

use tracing::{debug, warn};

use super::messages::{AckMessage, Envelope, Message};
use super::ProtocolServices;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{Role, Trade};
use crate::p2p::MailboxOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Fails if the peer is unreachable
    Direct,
    /// Stored for the peer if it is offline
    Mailbox,
}

pub fn envelope(services: &ProtocolServices, message: impl Into<Message>) -> Envelope {
    Envelope::new(
        services.node_address.clone(),
        services.pub_key_ring.clone(),
        message.into(),
    )
}

/// Send `message` to the party holding `role` in `trade`
pub async fn send_to_peer(
    services: &ProtocolServices,
    trade: &Trade,
    role: Role,
    message: impl Into<Message>,
    mode: SendMode,
) -> ProtocolResult<MailboxOutcome> {
    let peer = trade.peer(role);
    let address = peer
        .node_address
        .clone()
        .ok_or_else(|| ProtocolError::MissingData(format!("{role} node address")))?;
    let key = peer
        .pub_key_ring
        .clone()
        .ok_or_else(|| ProtocolError::MissingData(format!("{role} key ring")))?;
    let envelope = envelope(services, message);
    let class_name = envelope.message.class_name();

    debug!(
        trade_id = %crate::log_trade_id!(&trade.id),
        to = %role,
        message = class_name,
        uid = %crate::logging::sanitize::sanitize_uid(envelope.message.uid()),
        "Sending message"
    );

    let outcome = match mode {
        SendMode::Direct => services
            .delivery
            .send_direct(&address, &key, envelope)
            .await
            .map(|_| MailboxOutcome::Arrived),
        SendMode::Mailbox => services.delivery.send_mailbox(&address, &key, envelope).await,
    };
    outcome.map_err(|e| {
        warn!(
            trade_id = %crate::log_trade_id!(&trade.id),
            to = %role,
            message = class_name,
            error = %e,
            "Failed to send message"
        );
        ProtocolError::Delivery(e)
    })
}

/// Acknowledge `source` to its sender. Failures are logged only.
pub async fn send_ack(
    services: &ProtocolServices,
    source: &Envelope,
    success: bool,
    error_message: Option<String>,
) {
    if matches!(source.message, Message::Ack(_)) {
        return;
    }
    let ack = AckMessage::for_message(&source.message, &services.node_address, success, error_message);
    let envelope = envelope(services, ack);
    if let Err(e) = services
        .delivery
        .send_mailbox(&source.sender_node_address, &source.sender_pub_key_ring, envelope)
        .await
    {
        warn!(
            trade_id = %crate::log_trade_id!(source.message.trade_id()),
            message = source.message.class_name(),
            error = %e,
            "Failed to send ACK"
        );
    }
}
