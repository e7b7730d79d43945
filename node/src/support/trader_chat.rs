//! Chat between the two traders of a trade
//!
//! The channel is open while the trade is. Lines go to the other trader
//! through the mailbox, are kept once per uid and acknowledged on their own
//! ACK track. The first line of a conversation is preceded by a local system
//! notice.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::sender_role;
use crate::error::{ProtocolError, SupportError, SupportResult};
use crate::models::{Role, SupportType, Trade};
use crate::p2p::MailboxOutcome;
use crate::protocol::messages::{ChatMessage, Envelope, Message, MessageHeader};
use crate::protocol::outbox::{send_ack, send_to_peer, SendMode};
use crate::protocol::{ProtocolServices, TradeProtocol};
use crate::services::trade_manager::TradeManager;

const SYSTEM_NOTICE: &str =
    "Trader chat. Never share payment account details or send funds outside the trade.";

/// The other trader, or why this node cannot chat on the trade
fn counterparty(trade: &Trade) -> SupportResult<Role> {
    if trade.is_terminal() {
        return Err(SupportError::ChatClosed("trade is over".to_string()));
    }
    match trade.role {
        Role::Maker => Ok(Role::Taker),
        Role::Taker => Ok(Role::Maker),
        Role::Arbitrator => Err(SupportError::ChatClosed(
            "the arbitrator is not a trader".to_string(),
        )),
    }
}

fn add_system_notice(trade: &mut Trade, services: &ProtocolServices) {
    if !trade.chat_messages.is_empty() {
        return;
    }
    let mut notice = ChatMessage::new(
        MessageHeader::new(&trade.id, &services.node_address),
        SupportType::Trade,
        SYSTEM_NOTICE,
        false,
    );
    notice.system_message = true;
    notice.arrived = true;
    notice.acknowledged = true;
    trade.add_chat_message(notice);
}

pub struct TraderChatManager {
    trades: Arc<TradeManager>,
}

impl TraderChatManager {
    pub fn new(trades: Arc<TradeManager>) -> Arc<Self> {
        Arc::new(Self { trades })
    }

    fn services(&self) -> &Arc<ProtocolServices> {
        self.trades.services()
    }

    async fn protocol(&self, trade_id: &str) -> SupportResult<Arc<TradeProtocol>> {
        self.trades
            .protocol(trade_id)
            .await
            .ok_or_else(|| SupportError::Protocol(ProtocolError::TradeNotFound(trade_id.to_string())))
    }

    pub async fn chat_messages(&self, trade_id: &str) -> Vec<ChatMessage> {
        match self.trades.trade(trade_id).await {
            Some(trade) => trade.chat_messages,
            None => Vec::new(),
        }
    }

    /// Send a line to the other trader
    pub async fn send_chat_message(&self, trade_id: &str, text: &str) -> SupportResult<ChatMessage> {
        let protocol = self.protocol(trade_id).await?;
        let services = self.services();
        let mut trade = protocol.lock().await;
        let peer = counterparty(&trade)?;

        add_system_notice(&mut trade, services);
        let mut message = ChatMessage::new(
            MessageHeader::new(&trade.id, &services.node_address),
            SupportType::Trade,
            text,
            true,
        );
        match send_to_peer(services, &trade, peer, message.clone(), SendMode::Mailbox).await {
            Ok(MailboxOutcome::Arrived) => message.arrived = true,
            Ok(MailboxOutcome::StoredInMailbox) => message.stored_in_mailbox = true,
            Err(e) => message.ack_error = Some(e.to_string()),
        }
        trade.add_chat_message(message.clone());
        services.persistence.request_persistence();
        Ok(message)
    }

    /// Keep a line from the other trader and acknowledge it
    pub async fn on_chat_message(&self, envelope: Envelope) {
        let Message::Chat(message) = &envelope.message else {
            return;
        };
        let services = self.services();
        let result = self.receive(&envelope, message).await;
        match &result {
            Ok(()) => send_ack(services, &envelope, true, None).await,
            Err(e) => {
                warn!(
                    trade_id = %crate::log_trade_id!(envelope.message.trade_id()),
                    error = %e,
                    "Trader chat message rejected"
                );
                send_ack(services, &envelope, false, Some(e.to_string())).await;
            }
        }
    }

    async fn receive(&self, envelope: &Envelope, message: &ChatMessage) -> SupportResult<()> {
        let protocol = self.protocol(envelope.message.trade_id()).await?;
        let services = self.services();
        let mut trade = protocol.lock().await;
        let peer = counterparty(&trade)?;
        if sender_role(&trade, envelope) != Some(peer) {
            return Err(ProtocolError::UnexpectedSender {
                sender: envelope.sender_node_address.clone(),
                reason: "trader chat is between the two traders".to_string(),
            }
            .into());
        }

        add_system_notice(&mut trade, services);
        let mut received = message.clone();
        received.arrived = true;
        received.system_message = false;
        if trade.add_chat_message(received) {
            info!(trade_id = %crate::log_trade_id!(&trade.id), from = %peer, "💬 Trader chat message");
            services.persistence.request_persistence();
        } else {
            debug!(trade_id = %crate::log_trade_id!(&trade.id), "Duplicate trader chat message");
        }
        Ok(())
    }

    /// Record the other trader's ACK on the line it answers
    pub async fn on_ack(&self, envelope: Envelope) {
        let Message::Ack(ack) = &envelope.message else {
            return;
        };
        let Ok(protocol) = self.protocol(&ack.source_id).await else {
            return;
        };
        let services = self.services();
        if let Err(e) = services
            .delivery
            .remove_mailbox_message(&envelope.sender_node_address, &ack.source_uid)
            .await
        {
            debug!(error = %e, "Mailbox entry already gone");
        }

        let mut trade = protocol.lock().await;
        if let Some(message) = trade.chat_message_mut(&ack.source_uid) {
            message.acknowledged = ack.success;
            message.ack_error = ack.error_message.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use crate::protocol::test_support::test_services;
    use escrow_types::OfferDirection;

    #[test]
    fn test_counterparty_only_while_open() {
        let mut trade = sample_trade(OfferDirection::Sell, Role::Maker);
        assert_eq!(counterparty(&trade).ok(), Some(Role::Taker));
        trade.mark_failed("boom");
        assert!(matches!(counterparty(&trade), Err(SupportError::ChatClosed(_))));

        let arbitrator = sample_trade(OfferDirection::Sell, Role::Arbitrator);
        assert!(counterparty(&arbitrator).is_err());
    }

    #[test]
    fn test_system_notice_once() {
        let services = test_services("maker");
        let mut trade = sample_trade(OfferDirection::Sell, Role::Maker);
        add_system_notice(&mut trade, &services);
        add_system_notice(&mut trade, &services);
        assert_eq!(trade.chat_messages.len(), 1);
        assert!(trade.chat_messages[0].system_message);
        assert_eq!(trade.chat_messages[0].support_type, SupportType::Trade);
    }
}
