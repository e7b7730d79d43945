//! Dispute lifecycle shared by the mediation and refund tracks
//!
//! Traders open disputes with the arbitrator, which tells the other trader.
//! Both sides chat inside the dispute until the arbitrator closes it with a
//! signed [`DisputeResult`]. What a result means for the trade is up to the
//! [`DisputeTrack`].

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tracing::{debug, info, warn};

use super::sender_role;
use crate::error::{ProtocolError, SupportError, SupportResult};
use crate::models::{
    Dispute, DisputeReason, DisputeResult, DisputeState, DisputeStatus, Role, SupportType, Trade,
    Winner,
};
use crate::p2p::MailboxOutcome;
use crate::protocol::messages::{
    ChatMessage, DisputeClosedMessage, DisputeOpenedMessage, Envelope, Message, MessageHeader,
    PeerOpenedDisputeMessage,
};
use crate::protocol::outbox::{send_ack, send_to_peer, SendMode};
use crate::protocol::{ProtocolServices, TradeProtocol};
use crate::services::trade_manager::TradeManager;

/// Behavior specific to one support type
#[async_trait]
pub trait DisputeTrack: Send + Sync {
    fn support_type(&self) -> SupportType;

    /// Dispute state of a trader that opened a dispute
    fn requested_state(&self) -> DisputeState;

    /// Dispute state of a trader whose peer opened a dispute
    fn started_by_peer_state(&self) -> DisputeState;

    /// Agent: payout to ship with the result, if this track pays out directly
    async fn agent_payout(
        &self,
        trade: &mut Trade,
        services: &ProtocolServices,
        result: &DisputeResult,
    ) -> SupportResult<Option<String>>;

    /// Agent: the result was sent to both traders
    fn agent_closed(&self, trade: &mut Trade);

    /// Trader: apply a verified result
    async fn apply_result(
        &self,
        trade: &mut Trade,
        services: &ProtocolServices,
        message: &DisputeClosedMessage,
    ) -> SupportResult<()>;

    /// Trader: reset per-round data before a closed dispute is reopened
    fn reset_round(&self, _trade: &mut Trade) {}
}

/// The arbitrator's ruling, before it is signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeDecision {
    pub winner: Winner,
    pub reason: DisputeReason,
    pub summary_notes: String,
    pub buyer_payout_amount: u64,
    pub seller_payout_amount: u64,
}

pub struct DisputeManager {
    track: Box<dyn DisputeTrack>,
    trades: Arc<TradeManager>,
    /// Uids of dispute results already retried once
    retried: StdMutex<HashSet<String>>,
    me: Weak<DisputeManager>,
}

impl DisputeManager {
    pub fn new(track: Box<dyn DisputeTrack>, trades: Arc<TradeManager>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            track,
            trades,
            retried: StdMutex::new(HashSet::new()),
            me: me.clone(),
        })
    }

    pub fn support_type(&self) -> SupportType {
        self.track.support_type()
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

    fn not_found(&self, trade_id: &str) -> SupportError {
        SupportError::DisputeNotFound {
            trade_id: trade_id.to_string(),
            support_type: self.support_type().as_str(),
        }
    }

    /// Current dispute of this type for a trade
    pub async fn dispute(&self, trade_id: &str) -> Option<Dispute> {
        let protocol = self.trades.protocol(trade_id).await?;
        let trade = protocol.snapshot().await;
        trade.dispute(self.support_type()).cloned()
    }

    // ========================================================================
    // Trader actions
    // ========================================================================

    /// Open a dispute of this type with the arbitrator
    pub async fn open_dispute(&self, trade_id: &str) -> SupportResult<Dispute> {
        let protocol = self.protocol(trade_id).await?;
        let services = self.services();
        let support_type = self.support_type();
        let mut trade = protocol.lock().await;

        if trade.is_arbitrator() {
            return Err(SupportError::NotOpenable(
                "the arbitrator cannot open a dispute".to_string(),
            ));
        }
        if trade.is_terminal() {
            return Err(SupportError::NotOpenable("trade is already over".to_string()));
        }
        if support_type == SupportType::Mediation && trade.dispute_state.is_refund() {
            return Err(SupportError::NotOpenable(
                "trade is already with the refund agent".to_string(),
            ));
        }
        let contract = trade
            .contract
            .clone()
            .ok_or_else(|| SupportError::NotOpenable("no signed contract yet".to_string()))?;

        let reopening = match trade.dispute(support_type) {
            Some(existing) if !existing.is_closed() => {
                return Err(SupportError::AlreadyOpen(support_type.as_str()));
            }
            Some(_) => true,
            None => false,
        };

        let mut dispute = Dispute {
            id: uuid::Uuid::new_v4().to_string(),
            trade_id: trade.id.clone(),
            support_type,
            status: DisputeStatus::New,
            opener_pub_key_ring: services.pub_key_ring.clone(),
            opener_is_buyer: trade.is_buyer(),
            opener_is_maker: trade.role == Role::Maker,
            contract_hash: trade.contract_hash.clone().unwrap_or_default(),
            maker_payment_account_payload_hash: contract.maker_payment_account_payload_hash.clone(),
            taker_payment_account_payload_hash: contract.taker_payment_account_payload_hash.clone(),
            contract,
            chat: Vec::new(),
            result: None,
            opened_at: Utc::now(),
        };
        if reopening {
            self.track.reset_round(&mut trade);
            trade.disputes.retain(|d| d.support_type != support_type);
            dispute.reopen();
        }
        trade.disputes.push(dispute.clone());
        trade.set_dispute_state(self.track.requested_state());

        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            support_type = %support_type,
            reopened = reopening,
            "⚖️ Dispute opened"
        );
        let message = DisputeOpenedMessage {
            header: MessageHeader::new(&trade.id, &services.node_address),
            support_type,
            dispute: dispute.clone(),
        };
        send_to_peer(services, &trade, Role::Arbitrator, message, SendMode::Mailbox).await?;
        Ok(dispute)
    }

    /// Add a chat line to the dispute and send it to the other side
    pub async fn send_chat_message(&self, trade_id: &str, text: &str) -> SupportResult<ChatMessage> {
        let protocol = self.protocol(trade_id).await?;
        let services = self.services();
        let support_type = self.support_type();
        let mut trade = protocol.lock().await;
        if trade.dispute(support_type).is_none() {
            return Err(self.not_found(trade_id));
        }

        let mut message = ChatMessage::new(
            MessageHeader::new(&trade.id, &services.node_address),
            support_type,
            text,
            !trade.is_arbitrator(),
        );
        let recipients: &[Role] = if trade.is_arbitrator() {
            &[Role::Maker, Role::Taker]
        } else {
            &[Role::Arbitrator]
        };
        for role in recipients {
            match send_to_peer(services, &trade, *role, message.clone(), SendMode::Mailbox).await {
                Ok(MailboxOutcome::Arrived) => message.arrived = true,
                Ok(MailboxOutcome::StoredInMailbox) => message.stored_in_mailbox = true,
                Err(e) => message.ack_error = Some(e.to_string()),
            }
        }
        if let Some(dispute) = trade.dispute_mut(support_type) {
            dispute.add_chat_message(message.clone());
        }
        Ok(message)
    }

    // ========================================================================
    // Agent actions
    // ========================================================================

    /// Close the dispute with a signed result and send it to both traders
    pub async fn close_dispute(
        &self,
        trade_id: &str,
        decision: DisputeDecision,
    ) -> SupportResult<DisputeResult> {
        let protocol = self.protocol(trade_id).await?;
        let services = self.services();
        let support_type = self.support_type();
        let mut trade = protocol.lock().await;
        if !trade.is_arbitrator() {
            return Err(SupportError::NotAgent);
        }
        let dispute = trade
            .dispute(support_type)
            .ok_or_else(|| self.not_found(trade_id))?;
        if dispute.is_closed() {
            return Err(SupportError::InvalidResult("dispute is already closed".to_string()));
        }
        let opener_id = dispute.opener_pub_key_ring.short_id().to_string();

        let total = decision.buyer_payout_amount + decision.seller_payout_amount;
        if total == 0 || total > trade.total_escrowed() {
            return Err(SupportError::InvalidResult(format!(
                "payouts total {} but {} is escrowed",
                total,
                trade.total_escrowed()
            )));
        }

        let mut result = DisputeResult {
            trade_id: trade.id.clone(),
            trader_id: opener_id,
            winner: decision.winner,
            reason: decision.reason,
            summary_notes: decision.summary_notes,
            buyer_payout_amount: decision.buyer_payout_amount,
            seller_payout_amount: decision.seller_payout_amount,
            close_date: Utc::now(),
            agent_signature: None,
            agent_pub_key_ring: services.pub_key_ring.clone(),
        };
        result.sign(&services.key_ring);
        let payout_tx_hex = self.track.agent_payout(&mut trade, services, &result).await?;
        if let Some(dispute) = trade.dispute_mut(support_type) {
            dispute.close(result.clone());
        }

        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            support_type = %support_type,
            buyer = %crate::log_amount!(result.buyer_payout_amount),
            seller = %crate::log_amount!(result.seller_payout_amount),
            "⚖️ Dispute closed"
        );

        let mut stored = false;
        let mut first_error = None;
        for role in [Role::Maker, Role::Taker] {
            let message = DisputeClosedMessage {
                header: MessageHeader::new(&trade.id, &services.node_address),
                support_type,
                result: result.clone(),
                payout_tx_hex: payout_tx_hex.clone(),
            };
            match send_to_peer(services, &trade, role, message, SendMode::Mailbox).await {
                Ok(MailboxOutcome::Arrived) => {}
                Ok(MailboxOutcome::StoredInMailbox) => stored = true,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let state = match (&first_error, stored) {
            (Some(_), _) => DisputeState::ArbitratorSendFailedDisputeClosedMsg,
            (None, true) => DisputeState::ArbitratorStoredInMailboxDisputeClosedMsg,
            (None, false) => DisputeState::ArbitratorSentDisputeClosedMsg,
        };
        trade.set_dispute_state(state);
        self.track.agent_closed(&mut trade);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(result),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn dispatch(self: Arc<Self>, envelope: Envelope) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.on_support_message(envelope).await })
    }

    /// Apply a dispute-track message and acknowledge it
    pub async fn on_support_message(&self, envelope: Envelope) {
        let trade_id = envelope.message.trade_id().to_string();
        let uid = envelope.message.uid().to_string();
        let services = Arc::clone(self.services());

        let protocol = match self.protocol(&trade_id).await {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(
                    trade_id = %crate::log_trade_id!(&trade_id),
                    message = envelope.message.class_name(),
                    "Dispute message for unknown trade"
                );
                send_ack(&services, &envelope, false, Some(e.to_string())).await;
                return;
            }
        };

        let result = {
            let mut trade = protocol.lock().await;
            if trade.process_model.is_processed(&uid) {
                debug!(trade_id = %crate::log_trade_id!(&trade_id), "Duplicate dispute message");
                Ok(())
            } else {
                let result = match &envelope.message {
                    Message::DisputeOpened(m) => self.on_dispute_opened(&mut trade, &envelope, m).await,
                    Message::PeerOpenedDispute(m) => {
                        self.on_peer_opened_dispute(&mut trade, &envelope, m)
                    }
                    Message::Chat(m) => self.on_chat_message(&mut trade, &envelope, m),
                    Message::DisputeClosed(m) => self.on_dispute_closed(&mut trade, &envelope, m).await,
                    _ => return,
                };
                if result.is_ok() {
                    trade.process_model.mark_processed(&uid);
                }
                result
            }
        };

        match result {
            Err(SupportError::DisputeNotFound { .. }) if self.schedule_retry(&envelope) => {}
            Ok(()) => {
                self.retried_uids().remove(&uid);
                send_ack(&services, &envelope, true, None).await;
            }
            Err(e) => {
                self.retried_uids().remove(&uid);
                warn!(
                    trade_id = %crate::log_trade_id!(&trade_id),
                    message = envelope.message.class_name(),
                    error = %e,
                    "Dispute message rejected"
                );
                send_ack(&services, &envelope, false, Some(e.to_string())).await;
            }
        }
    }

    fn retried_uids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.retried.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A result can arrive before the dispute it closes. Apply it once more
    /// after the retry delay.
    fn schedule_retry(&self, envelope: &Envelope) -> bool {
        let uid = envelope.message.uid().to_string();
        if !self.retried_uids().insert(uid) {
            return false;
        }
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        warn!(
            trade_id = %crate::log_trade_id!(envelope.message.trade_id()),
            "Dispute result before its dispute, retrying"
        );
        let delay = self.services().config.retry_delay;
        let envelope = envelope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.dispatch(envelope).await;
        });
        true
    }

    async fn on_dispute_opened(
        &self,
        trade: &mut Trade,
        envelope: &Envelope,
        message: &DisputeOpenedMessage,
    ) -> SupportResult<()> {
        let services = self.services();
        let support_type = self.support_type();
        if !trade.is_arbitrator() {
            return Err(SupportError::NotAgent);
        }
        let opener = match sender_role(trade, envelope) {
            Some(role @ (Role::Maker | Role::Taker)) => role,
            _ => {
                return Err(ProtocolError::UnexpectedSender {
                    sender: envelope.sender_node_address.clone(),
                    reason: "disputes are opened by traders".to_string(),
                }
                .into())
            }
        };
        let incoming = &message.dispute;
        if incoming.opener_pub_key_ring != envelope.sender_pub_key_ring || incoming.trade_id != trade.id {
            return Err(ProtocolError::InvalidMessage("dispute opener does not match sender".into()).into());
        }
        if trade.contract_hash.as_deref() != Some(incoming.contract_hash.as_str()) {
            return Err(ProtocolError::ContractMismatch("dispute contract hash".into()).into());
        }

        match trade.dispute_mut(support_type) {
            Some(existing) if !existing.is_closed() => {
                debug!(
                    trade_id = %crate::log_trade_id!(&trade.id),
                    "Dispute already open, keeping the first one"
                );
                return Ok(());
            }
            Some(existing) => {
                *existing = incoming.clone();
                existing.status = DisputeStatus::Reopened;
            }
            None => {
                let mut dispute = incoming.clone();
                dispute.mark_seen();
                trade.disputes.push(dispute);
            }
        }
        trade.set_dispute_state(DisputeState::DisputeOpened);
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            support_type = %support_type,
            opener = %opener,
            "Dispute received"
        );

        let peer = if opener == Role::Maker { Role::Taker } else { Role::Maker };
        let forward = PeerOpenedDisputeMessage {
            header: MessageHeader::new(&trade.id, &services.node_address),
            support_type,
            dispute: incoming.clone(),
        };
        if let Err(e) = send_to_peer(services, trade, peer, forward, SendMode::Mailbox).await {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                error = %e,
                "Could not tell the peer about the dispute"
            );
        }
        Ok(())
    }

    fn on_peer_opened_dispute(
        &self,
        trade: &mut Trade,
        envelope: &Envelope,
        message: &PeerOpenedDisputeMessage,
    ) -> SupportResult<()> {
        let support_type = self.support_type();
        if sender_role(trade, envelope) != Some(Role::Arbitrator) {
            return Err(ProtocolError::UnexpectedSender {
                sender: envelope.sender_node_address.clone(),
                reason: "only the arbitrator forwards disputes".to_string(),
            }
            .into());
        }
        match trade.dispute(support_type) {
            Some(existing) if !existing.is_closed() => {
                // Both traders opened at once; ours stands
                return Ok(());
            }
            Some(_) => {
                self.track.reset_round(trade);
                trade.disputes.retain(|d| d.support_type != support_type);
            }
            None => {}
        }
        trade.disputes.push(message.dispute.clone());
        trade.set_dispute_state(self.track.started_by_peer_state());
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            support_type = %support_type,
            "Peer opened a dispute"
        );
        Ok(())
    }

    fn on_chat_message(
        &self,
        trade: &mut Trade,
        envelope: &Envelope,
        message: &ChatMessage,
    ) -> SupportResult<()> {
        let sender = sender_role(trade, envelope);
        let expected = if trade.is_arbitrator() {
            matches!(sender, Some(Role::Maker | Role::Taker))
        } else {
            sender == Some(Role::Arbitrator)
        };
        if !expected {
            return Err(ProtocolError::UnexpectedSender {
                sender: envelope.sender_node_address.clone(),
                reason: "chat goes between traders and the arbitrator".to_string(),
            }
            .into());
        }
        let trade_id = trade.id.clone();
        let dispute = trade
            .dispute_mut(self.support_type())
            .ok_or_else(|| self.not_found(&trade_id))?;
        let mut received = message.clone();
        received.arrived = true;
        if !dispute.add_chat_message(received) {
            debug!(trade_id = %crate::log_trade_id!(&trade_id), "Duplicate chat message");
        }
        Ok(())
    }

    async fn on_dispute_closed(
        &self,
        trade: &mut Trade,
        envelope: &Envelope,
        message: &DisputeClosedMessage,
    ) -> SupportResult<()> {
        let services = self.services();
        let support_type = self.support_type();
        if sender_role(trade, envelope) != Some(Role::Arbitrator) {
            return Err(ProtocolError::UnexpectedSender {
                sender: envelope.sender_node_address.clone(),
                reason: "only the arbitrator closes disputes".to_string(),
            }
            .into());
        }
        let trade_id = trade.id.clone();
        if trade.dispute(support_type).is_none() {
            return Err(self.not_found(&trade_id));
        }

        let result = &message.result;
        result
            .verify(&trade.offer.arbitrator_pub_key_ring)
            .map_err(|e| SupportError::SignatureInvalid(e.to_string()))?;
        if result.trade_id != trade.id || result.total_payout() > trade.total_escrowed() {
            return Err(SupportError::InvalidResult(format!(
                "result pays {} from {} escrowed",
                result.total_payout(),
                trade.total_escrowed()
            )));
        }

        if let Some(dispute) = trade.dispute_mut(support_type) {
            dispute.close(result.clone());
        }
        self.track.apply_result(trade, services, message).await?;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            support_type = %support_type,
            winner = ?result.winner,
            "Dispute result received"
        );
        Ok(())
    }

    /// Record an ACK for a dispute-track message this node sent
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
        if !ack.success {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                message = %ack.source_msg_class_name,
                error = ack.error_message.as_deref().unwrap_or_default(),
                "Dispute message rejected by peer"
            );
        }
        match ack.source_msg_class_name.as_str() {
            "ChatMessage" => {
                if let Some(message) = trade
                    .dispute_mut(self.support_type())
                    .and_then(|d| d.chat_message_mut(&ack.source_uid))
                {
                    message.acknowledged = ack.success;
                    message.ack_error = ack.error_message.clone();
                }
            }
            "DisputeClosedMessage" if ack.success && trade.is_arbitrator() => {
                if matches!(
                    trade.dispute_state,
                    DisputeState::ArbitratorSentDisputeClosedMsg
                        | DisputeState::ArbitratorStoredInMailboxDisputeClosedMsg
                ) {
                    trade.set_dispute_state(DisputeState::ArbitratorSawArrivedDisputeClosedMsg);
                }
            }
            "MediatedPayoutTxSignatureMessage" if ack.success => {
                super::mediation::on_signature_acked(&mut trade);
            }
            _ => {}
        }
    }
}
