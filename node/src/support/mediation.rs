//! Mediation track
//!
//! The mediator proposes a split. Each trader accepts or rejects it. The first
//! to accept signs a payout for the split and sends it over; the second to
//! accept completes the signature and publishes. A rejection ends the round
//! without a payout, and the trader can take the trade to the refund agent.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispute_manager::{DisputeManager, DisputeTrack};
use super::sender_role;
use crate::error::{ProtocolError, SupportError, SupportResult};
use crate::models::{
    DisputeResult, DisputeState, MediatedPayout, MediationResultState, PayoutState, Role,
    SupportType, Trade,
};
use crate::p2p::MailboxOutcome;
use crate::protocol::messages::{
    DisputeClosedMessage, Envelope, MediatedPayoutTxPublishedMessage,
    MediatedPayoutTxSignatureMessage, Message, MessageHeader,
};
use crate::protocol::outbox::{send_ack, send_to_peer, SendMode};
use crate::protocol::tasks::counterparty;
use crate::protocol::tasks::payment::{import_peer_multisig, publish_payout};
use crate::protocol::ProtocolServices;
use crate::services::trade_manager::TradeManager;

pub struct MediationTrack;

#[async_trait]
impl DisputeTrack for MediationTrack {
    fn support_type(&self) -> SupportType {
        SupportType::Mediation
    }

    fn requested_state(&self) -> DisputeState {
        DisputeState::MediationRequested
    }

    fn started_by_peer_state(&self) -> DisputeState {
        DisputeState::MediationStartedByPeer
    }

    async fn agent_payout(
        &self,
        _trade: &mut Trade,
        _services: &ProtocolServices,
        _result: &DisputeResult,
    ) -> SupportResult<Option<String>> {
        Ok(None)
    }

    fn agent_closed(&self, _trade: &mut Trade) {}

    async fn apply_result(
        &self,
        trade: &mut Trade,
        _services: &ProtocolServices,
        message: &DisputeClosedMessage,
    ) -> SupportResult<()> {
        trade.process_model.mediated_payout = Some(MediatedPayout {
            buyer_amount: message.result.buyer_payout_amount,
            seller_amount: message.result.seller_payout_amount,
        });
        trade.set_dispute_state(DisputeState::MediationClosed);
        Ok(())
    }

    fn reset_round(&self, trade: &mut Trade) {
        trade.mediation_result_state = MediationResultState::Undefined;
        trade.process_model.mediated_payout = None;
        for role in [Role::Maker, Role::Taker] {
            trade.peer_mut(role).mediated_payout_tx_hex = None;
        }
    }
}

/// Our signature message reached the peer
pub(crate) fn on_signature_acked(trade: &mut Trade) {
    if matches!(
        trade.mediation_result_state,
        MediationResultState::SigMsgSent | MediationResultState::SigMsgInMailbox
    ) {
        trade.mediation_result_state = MediationResultState::SigMsgArrived;
    }
}

fn set_mediation_result(trade: &mut Trade, state: MediationResultState) {
    info!(
        trade_id = %crate::log_trade_id!(&trade.id),
        from = %trade.mediation_result_state,
        to = %state,
        "Mediation result state changed"
    );
    trade.mediation_result_state = state;
}

pub struct MediationManager {
    disputes: Arc<DisputeManager>,
    trades: Arc<TradeManager>,
}

impl MediationManager {
    pub fn new(trades: Arc<TradeManager>) -> Arc<Self> {
        Arc::new(Self {
            disputes: DisputeManager::new(Box::new(MediationTrack), Arc::clone(&trades)),
            trades,
        })
    }

    pub fn disputes(&self) -> &Arc<DisputeManager> {
        &self.disputes
    }

    /// The proposed split, if this trader may still decide on it
    fn open_proposal(trade: &Trade) -> SupportResult<MediatedPayout> {
        if trade.is_arbitrator() {
            return Err(SupportError::NotOpenable("the mediator does not vote".to_string()));
        }
        let proposal = match (trade.dispute_state, &trade.process_model.mediated_payout) {
            (DisputeState::MediationClosed, Some(proposal)) => *proposal,
            _ => {
                return Err(SupportError::DisputeNotFound {
                    trade_id: trade.id.clone(),
                    support_type: SupportType::Mediation.as_str(),
                })
            }
        };
        match trade.mediation_result_state {
            state if state.has_accepted() => Err(SupportError::MediationSettled("accepted")),
            MediationResultState::MediationResultRejected => {
                Err(SupportError::MediationSettled("rejected"))
            }
            MediationResultState::PayoutTxPublished => Err(SupportError::MediationSettled("paid out")),
            _ => Ok(proposal),
        }
    }

    /// Accept the mediator's split. Signs and sends our half, or completes
    /// and publishes the payout if the peer already signed.
    pub async fn accept_mediation_result(&self, trade_id: &str) -> SupportResult<()> {
        let protocol = self
            .trades
            .protocol(trade_id)
            .await
            .ok_or_else(|| SupportError::Protocol(ProtocolError::TradeNotFound(trade_id.to_string())))?;
        let services = Arc::clone(protocol.services());
        let mut trade = protocol.lock().await;
        let proposal = Self::open_proposal(&trade)?;
        set_mediation_result(&mut trade, MediationResultState::MediationResultAccepted);

        let peer = counterparty(trade.role);
        match trade.peer(peer).mediated_payout_tx_hex.clone() {
            Some(peer_hex) => finalize_payout(&mut trade, &services, &peer_hex, &proposal).await,
            None => sign_and_send(&mut trade, &services, &proposal).await,
        }
    }

    /// Reject the mediator's split. No payout follows from this round.
    pub async fn reject_mediation_result(&self, trade_id: &str) -> SupportResult<()> {
        let protocol = self
            .trades
            .protocol(trade_id)
            .await
            .ok_or_else(|| SupportError::Protocol(ProtocolError::TradeNotFound(trade_id.to_string())))?;
        let mut trade = protocol.lock().await;
        Self::open_proposal(&trade)?;
        set_mediation_result(&mut trade, MediationResultState::MediationResultRejected);
        Ok(())
    }

    /// Apply a mediated payout signature or publication notice and acknowledge it
    pub async fn on_mediated_payout_message(&self, envelope: Envelope) {
        let trade_id = envelope.message.trade_id().to_string();
        let uid = envelope.message.uid().to_string();
        let Some(protocol) = self.trades.protocol(&trade_id).await else {
            warn!(trade_id = %crate::log_trade_id!(&trade_id), "Mediated payout message for unknown trade");
            send_ack(self.trades.services(), &envelope, false, Some(format!("trade {trade_id} not found")))
                .await;
            return;
        };
        let services = Arc::clone(protocol.services());

        let result = {
            let mut trade = protocol.lock().await;
            if trade.process_model.is_processed(&uid) {
                Ok(())
            } else {
                let result = match &envelope.message {
                    Message::MediatedPayoutTxSignature(m) => {
                        on_payout_signature(&mut trade, &services, &envelope, m).await
                    }
                    Message::MediatedPayoutTxPublished(m) => {
                        on_payout_published(&mut trade, &services, &envelope, m).await
                    }
                    _ => return,
                };
                if result.is_ok() {
                    trade.process_model.mark_processed(&uid);
                }
                result
            }
        };

        match result {
            Ok(()) => send_ack(&services, &envelope, true, None).await,
            Err(e) => {
                warn!(
                    trade_id = %crate::log_trade_id!(&trade_id),
                    message = envelope.message.class_name(),
                    error = %e,
                    "Mediated payout message rejected"
                );
                send_ack(&services, &envelope, false, Some(e.to_string())).await;
            }
        }
    }
}

/// Sign a payout for the proposal and send it to the counterparty
async fn sign_and_send(
    trade: &mut Trade,
    services: &ProtocolServices,
    proposal: &MediatedPayout,
) -> SupportResult<()> {
    import_peer_multisig(trade, services).await?;
    let destinations = trade.payout_destinations(proposal.buyer_amount, proposal.seller_amount)?;
    let payout = services.wallet.create_payout_tx(&trade.id, &destinations).await?;
    trade.self_peer_mut().mediated_payout_tx_hex = Some(payout.hex.clone());

    let message = MediatedPayoutTxSignatureMessage {
        header: MessageHeader::new(&trade.id, &services.node_address),
        payout_tx_hex: payout.hex,
    };
    let peer = counterparty(trade.role);
    match send_to_peer(services, trade, peer, message, SendMode::Mailbox).await {
        Ok(MailboxOutcome::Arrived) => {
            set_mediation_result(trade, MediationResultState::SigMsgSent);
            Ok(())
        }
        Ok(MailboxOutcome::StoredInMailbox) => {
            set_mediation_result(trade, MediationResultState::SigMsgInMailbox);
            Ok(())
        }
        Err(e) => {
            set_mediation_result(trade, MediationResultState::SigMsgSendFailed);
            Err(e.into())
        }
    }
}

/// Complete the peer's half-signed payout, publish it and close the trade
async fn finalize_payout(
    trade: &mut Trade,
    services: &ProtocolServices,
    peer_hex: &str,
    proposal: &MediatedPayout,
) -> SupportResult<()> {
    let payout = services.wallet.describe_payout_tx(peer_hex).await?;
    let destinations = trade.payout_destinations(proposal.buyer_amount, proposal.seller_amount)?;
    if !payout.matches_destinations(&destinations) || payout.signature_count == 0 {
        return Err(SupportError::InvalidResult(
            "peer's payout does not match the mediated split".to_string(),
        ));
    }
    import_peer_multisig(trade, services).await?;
    let signed = services.wallet.sign_multisig_tx(&trade.id, peer_hex).await?;
    if !signed.is_fully_signed() {
        return Err(ProtocolError::Internal("mediated payout not fully signed".to_string()).into());
    }
    publish_payout(trade, services, &signed.hex).await?;
    set_mediation_result(trade, MediationResultState::PayoutTxPublished);
    trade.mark_closed();

    for role in [counterparty(trade.role), Role::Arbitrator] {
        let notice = MediatedPayoutTxPublishedMessage {
            header: MessageHeader::new(&trade.id, &services.node_address),
            payout_tx_hex: signed.hex.clone(),
        };
        if let Err(e) = send_to_peer(services, trade, role, notice, SendMode::Mailbox).await {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                to = %role,
                error = %e,
                "Could not announce the mediated payout"
            );
        }
    }
    Ok(())
}

async fn on_payout_signature(
    trade: &mut Trade,
    services: &ProtocolServices,
    envelope: &Envelope,
    message: &MediatedPayoutTxSignatureMessage,
) -> SupportResult<()> {
    let peer = counterparty(trade.role);
    if trade.is_arbitrator() || sender_role(trade, envelope) != Some(peer) {
        return Err(ProtocolError::UnexpectedSender {
            sender: envelope.sender_node_address.clone(),
            reason: "mediated payout signatures come from the counterparty".to_string(),
        }
        .into());
    }
    trade.peer_mut(peer).mediated_payout_tx_hex = Some(message.payout_tx_hex.clone());

    let state = trade.mediation_result_state;
    if state.has_accepted() {
        let proposal = trade
            .process_model
            .mediated_payout
            .ok_or_else(|| SupportError::InvalidResult("no mediated split on record".to_string()))?;
        return finalize_payout(trade, services, &message.payout_tx_hex, &proposal).await;
    }
    if state == MediationResultState::Undefined {
        set_mediation_result(trade, MediationResultState::ReceivedSigMsg);
    }
    debug!(
        trade_id = %crate::log_trade_id!(&trade.id),
        state = %trade.mediation_result_state,
        "Peer signed the mediated payout"
    );
    Ok(())
}

async fn on_payout_published(
    trade: &mut Trade,
    services: &ProtocolServices,
    envelope: &Envelope,
    message: &MediatedPayoutTxPublishedMessage,
) -> SupportResult<()> {
    if !matches!(sender_role(trade, envelope), Some(Role::Maker | Role::Taker)) {
        return Err(ProtocolError::UnexpectedSender {
            sender: envelope.sender_node_address.clone(),
            reason: "mediated payouts are published by traders".to_string(),
        }
        .into());
    }
    let payout = services.wallet.describe_payout_tx(&message.payout_tx_hex).await?;
    let relayed = services
        .daemon
        .get_tx(&payout.hash)
        .await?
        .map(|info| info.relayed)
        .unwrap_or(false);
    if !relayed {
        return Err(ProtocolError::Verification("announced payout is not on the network".to_string()).into());
    }
    trade.payout_tx_hash = Some(payout.hash);
    trade.payout_tx_hex = Some(payout.hex);
    trade.set_payout_state(PayoutState::PayoutPublished);
    if !trade.is_arbitrator() {
        set_mediation_result(trade, MediationResultState::PayoutTxPublished);
    }
    trade.mark_closed();
    Ok(())
}
