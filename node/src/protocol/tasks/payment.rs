//! Payment confirmation and payout
//!
//! The buyer confirms the counter-currency payment and hands the seller a
//! half-signed payout. The seller confirms receipt, completes the signature
//! and publishes. Both messages are copied to the arbitrator, which follows
//! along and publishes the payout itself if it never saw it.

use async_trait::async_trait;
use tracing::{info, warn};

use super::deposit::reveal_payment_account;
use super::{counterparty, expect_sender, required};
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{PayoutState, Phase, Role, State, Trade};
use crate::p2p::MailboxOutcome;
use crate::protocol::condition::Condition;
use crate::protocol::messages::{MessageHeader, PaymentReceivedMessage, PaymentSentMessage};
use crate::protocol::outbox::{send_to_peer, SendMode};
use crate::protocol::pipeline::{tasks, Pipeline, Task, TaskContext};
use crate::protocol::ProtocolServices;

// ============================================================================
// Pipelines
// ============================================================================

/// Buyer confirms in the UI that the payment went out
pub fn payment_sent_pipeline(counter_currency_tx_id: Option<String>) -> Pipeline {
    Pipeline::new(
        "ConfirmPaymentSent",
        Condition::new()
            .phase(&[Phase::DepositsUnlocked, Phase::PaymentSent])
            .confirm_permitted(),
        tasks![
            BuyerPreparePaymentSent { counter_currency_tx_id },
            BuyerSendPaymentSent
        ],
    )
}

/// Seller confirms in the UI that the payment arrived
pub fn payment_received_pipeline() -> Pipeline {
    Pipeline::new(
        "ConfirmPaymentReceived",
        Condition::new()
            .phase(&[Phase::PaymentSent, Phase::PaymentReceived])
            .confirm_permitted(),
        tasks![SellerSignAndPublishPayout, SellerSendPaymentReceived],
    )
}

pub fn seller_payment_sent_pipeline(role: Role) -> Pipeline {
    Pipeline::new(
        "PaymentSent",
        Condition::new()
            .min_phase(Phase::DepositsPublished)
            .from(&[counterparty(role)])
            .ignore_when(|trade| trade.state() >= State::SellerReceivedPaymentSentMsg),
        tasks![SellerProcessPaymentSent],
    )
}

pub fn buyer_payment_received_pipeline(role: Role) -> Pipeline {
    Pipeline::new(
        "PaymentReceived",
        Condition::new()
            .min_phase(Phase::PaymentSent)
            .from(&[counterparty(role)])
            .ignore_when(|trade| trade.state() >= State::BuyerReceivedPaymentReceivedMsg),
        tasks![ProcessPaymentReceived],
    )
}

pub fn arbitrator_payment_sent_pipeline() -> Pipeline {
    Pipeline::new(
        "PaymentSent",
        Condition::new()
            .min_phase(Phase::DepositsPublished)
            .from(&[Role::Maker, Role::Taker])
            .ignore_when(|trade| trade.state() >= State::BuyerSentPaymentSentMsg),
        tasks![ArbitratorProcessPaymentSent],
    )
}

pub fn arbitrator_payment_received_pipeline() -> Pipeline {
    Pipeline::new(
        "PaymentReceived",
        Condition::new()
            .min_phase(Phase::DepositsPublished)
            .from(&[Role::Maker, Role::Taker])
            .ignore_when(|trade| trade.state() >= State::SellerSentPaymentReceivedMsg),
        tasks![ProcessPaymentReceived],
    )
}

// ============================================================================
// Helpers
// ============================================================================

/// Import the other parties' updated multisig info so the wallet can sign
pub(crate) async fn import_peer_multisig(trade: &Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    let hexes = trade.peer_updated_multisig_hexes();
    if hexes.is_empty() {
        return Err(ProtocolError::MissingData(
            "updated multisig info from peers".to_string(),
        ));
    }
    services.wallet.import_multisig_hex(&trade.id, &hexes).await?;
    Ok(())
}

/// Submit a fully signed payout and record it on the trade
pub(crate) async fn publish_payout(
    trade: &mut Trade,
    services: &ProtocolServices,
    payout_tx_hex: &str,
) -> ProtocolResult<String> {
    let result = services.daemon.submit_tx_hex(payout_tx_hex, false).await?;
    trade.payout_tx_hash = Some(result.hash.clone());
    trade.payout_tx_hex = Some(payout_tx_hex.to_string());
    trade.set_payout_state(PayoutState::PayoutPublished);
    info!(
        trade_id = %crate::log_trade_id!(&trade.id),
        txid = %crate::log_txid!(&result.hash),
        already_known = result.already_known,
        "💰 Payout published"
    );
    Ok(result.hash)
}

fn outputs_mismatch() -> ProtocolError {
    ProtocolError::Verification("payout outputs do not match the contract".to_string())
}

// ============================================================================
// Buyer
// ============================================================================

pub struct BuyerPreparePaymentSent {
    counter_currency_tx_id: Option<String>,
}

#[async_trait]
impl Task for BuyerPreparePaymentSent {
    fn name(&self) -> &'static str {
        "BuyerPreparePaymentSent"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if !trade.is_buyer() {
            return Err(ProtocolError::NotPermitted(
                "only the buyer confirms payment sent".to_string(),
            ));
        }
        if trade.process_model.payment_sent_message.is_some() {
            // Resending the stored message keeps its uid
            return Ok(());
        }

        trade.counter_currency_tx_id = self.counter_currency_tx_id.clone();
        trade.advance_state(State::BuyerConfirmedInUiPaymentSent)?;
        import_peer_multisig(trade, services).await?;

        let destinations = trade.regular_payout_destinations()?;
        let payout = services.wallet.create_payout_tx(&trade.id, &destinations).await?;
        let updated = services.wallet.export_multisig_hex(&trade.id).await?;
        trade.self_peer_mut().updated_multisig_hex = Some(updated.clone());
        trade.payout_tx_hash = Some(payout.hash.clone());
        trade.payout_tx_hex = Some(payout.hex.clone());

        let message = PaymentSentMessage {
            header: MessageHeader::new(&trade.id, &services.node_address),
            counter_currency_tx_id: trade.counter_currency_tx_id.clone(),
            payout_tx_hex: payout.hex,
            updated_multisig_hex: updated,
            payment_account_key: required(&trade.self_peer().payment_account_key, || {
                "own payment account key".into()
            })?,
        };
        trade.process_model.payment_sent_message = Some(message);
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            txid = %crate::log_txid!(&payout.hash),
            "Payout prepared"
        );
        Ok(())
    }
}

pub struct BuyerSendPaymentSent;

#[async_trait]
impl Task for BuyerSendPaymentSent {
    fn name(&self) -> &'static str {
        "BuyerSendPaymentSent"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        let message = required(&trade.process_model.payment_sent_message, || {
            "payment sent message".into()
        })?;
        let seller = trade.seller_role();

        match send_to_peer(services, trade, seller, message.clone(), SendMode::Mailbox).await {
            Ok(MailboxOutcome::Arrived) => {
                trade.set_state(State::BuyerSentPaymentSentMsg);
            }
            Ok(MailboxOutcome::StoredInMailbox) => {
                trade.set_state(State::BuyerStoredInMailboxPaymentSentMsg);
            }
            Err(e) => {
                trade.set_state(State::BuyerSendFailedPaymentSentMsg);
                return Err(e);
            }
        }
        if let Err(e) = send_to_peer(services, trade, Role::Arbitrator, message, SendMode::Mailbox).await {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                error = %e,
                "Arbitrator did not get the payment sent message"
            );
        }
        Ok(())
    }
}

/// Check a completed payout from the seller and publish it if nobody has yet
pub struct ProcessPaymentReceived;

#[async_trait]
impl Task for ProcessPaymentReceived {
    fn name(&self) -> &'static str {
        "ProcessPaymentReceived"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let message: &PaymentReceivedMessage = ctx.message()?;
        let sender = ctx.sender()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        let seller = trade.seller_role();
        expect_sender(sender, seller, "PaymentReceivedMessage")?;

        let seller_key = required(&trade.peer(seller).pub_key_ring, || "seller key ring".into())?;
        let payout = services.wallet.describe_payout_tx(&message.signed_payout_tx_hex).await?;
        seller_key
            .verify(payout.hash.as_bytes(), &message.seller_signature)
            .map_err(|e| ProtocolError::SignatureMismatch(format!("payout signature: {e}")))?;
        if !payout.is_fully_signed() {
            return Err(ProtocolError::Verification("payout is not fully signed".to_string()));
        }
        if !payout.matches_destinations(&trade.regular_payout_destinations()?) {
            return Err(outputs_mismatch());
        }
        trade.peer_mut(seller).updated_multisig_hex = Some(message.updated_multisig_hex.clone());

        let relayed = services
            .daemon
            .get_tx(&payout.hash)
            .await?
            .map(|info| info.relayed)
            .unwrap_or(false);
        if relayed {
            trade.payout_tx_hash = Some(payout.hash.clone());
            trade.payout_tx_hex = Some(payout.hex.clone());
            trade.set_payout_state(PayoutState::PayoutPublished);
        } else {
            publish_payout(trade, services, &payout.hex).await?;
        }

        let state = if trade.is_arbitrator() {
            State::SellerSentPaymentReceivedMsg
        } else {
            State::BuyerReceivedPaymentReceivedMsg
        };
        trade.advance_state(state)?;
        Ok(())
    }
}

// ============================================================================
// Seller
// ============================================================================

pub struct SellerProcessPaymentSent;

#[async_trait]
impl Task for SellerProcessPaymentSent {
    fn name(&self) -> &'static str {
        "SellerProcessPaymentSent"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let message: &PaymentSentMessage = ctx.message()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;

        let payout = services.wallet.describe_payout_tx(&message.payout_tx_hex).await?;
        if !payout.matches_destinations(&trade.regular_payout_destinations()?) {
            return Err(outputs_mismatch());
        }

        let buyer = trade.buyer_role();
        let expected = trade.contract()?.buyer_payment_account_payload_hash().to_string();
        reveal_payment_account(trade, buyer, &message.payment_account_key, &expected)?;
        trade.peer_mut(buyer).updated_multisig_hex = Some(message.updated_multisig_hex.clone());
        trade.counter_currency_tx_id = message.counter_currency_tx_id.clone();
        trade.payout_tx_hash = Some(payout.hash);
        trade.payout_tx_hex = Some(payout.hex);
        trade.advance_state(State::SellerReceivedPaymentSentMsg)?;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            "Buyer reports payment sent"
        );
        Ok(())
    }
}

pub struct SellerSignAndPublishPayout;

#[async_trait]
impl Task for SellerSignAndPublishPayout {
    fn name(&self) -> &'static str {
        "SellerSignAndPublishPayout"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if !trade.is_seller() {
            return Err(ProtocolError::NotPermitted(
                "only the seller confirms payment received".to_string(),
            ));
        }
        if trade.process_model.payment_received_message.is_some() {
            return Ok(());
        }

        trade.advance_state(State::SellerConfirmedInUiPaymentReceipt)?;
        import_peer_multisig(trade, services).await?;

        let unsigned = required(&trade.payout_tx_hex, || "payout tx from the buyer".into())?;
        let payout = services.wallet.describe_payout_tx(&unsigned).await?;
        if !payout.matches_destinations(&trade.regular_payout_destinations()?) {
            return Err(outputs_mismatch());
        }
        let signed = services.wallet.sign_multisig_tx(&trade.id, &unsigned).await?;
        if !signed.is_fully_signed() {
            return Err(ProtocolError::Internal(format!(
                "payout has {} signatures after signing",
                signed.signature_count
            )));
        }
        publish_payout(trade, services, &signed.hex).await?;
        Ok(())
    }
}

pub struct SellerSendPaymentReceived;

#[async_trait]
impl Task for SellerSendPaymentReceived {
    fn name(&self) -> &'static str {
        "SellerSendPaymentReceived"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;

        let message = match &trade.process_model.payment_received_message {
            Some(message) => message.clone(),
            None => {
                let hash = required(&trade.payout_tx_hash, || "payout tx hash".into())?;
                let hex = required(&trade.payout_tx_hex, || "payout tx hex".into())?;
                let updated = services.wallet.export_multisig_hex(&trade.id).await?;
                trade.self_peer_mut().updated_multisig_hex = Some(updated.clone());
                let message = PaymentReceivedMessage {
                    header: MessageHeader::new(&trade.id, &services.node_address),
                    signed_payout_tx_hex: hex,
                    updated_multisig_hex: updated,
                    seller_signature: services.key_ring.sign(hash.as_bytes()),
                };
                trade.process_model.payment_received_message = Some(message.clone());
                message
            }
        };

        let buyer = trade.buyer_role();
        match send_to_peer(services, trade, buyer, message.clone(), SendMode::Mailbox).await {
            Ok(MailboxOutcome::Arrived) => {
                trade.set_state(State::SellerSentPaymentReceivedMsg);
            }
            Ok(MailboxOutcome::StoredInMailbox) => {
                trade.set_state(State::SellerStoredInMailboxPaymentReceivedMsg);
            }
            Err(e) => {
                trade.set_state(State::SellerSendFailedPaymentReceivedMsg);
                return Err(e);
            }
        }
        if let Err(e) = send_to_peer(services, trade, Role::Arbitrator, message, SendMode::Mailbox).await {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                error = %e,
                "Arbitrator did not get the payment received message"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Arbitrator
// ============================================================================

pub struct ArbitratorProcessPaymentSent;

#[async_trait]
impl Task for ArbitratorProcessPaymentSent {
    fn name(&self) -> &'static str {
        "ArbitratorProcessPaymentSent"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let message: &PaymentSentMessage = ctx.message()?;
        let sender = ctx.sender()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        let buyer = trade.buyer_role();
        expect_sender(sender, buyer, "PaymentSentMessage")?;

        let payout = services.wallet.describe_payout_tx(&message.payout_tx_hex).await?;
        if !payout.matches_destinations(&trade.regular_payout_destinations()?) {
            return Err(outputs_mismatch());
        }
        let peer = trade.peer_mut(buyer);
        peer.updated_multisig_hex = Some(message.updated_multisig_hex.clone());
        peer.payment_account_key = Some(message.payment_account_key.clone());
        trade.counter_currency_tx_id = message.counter_currency_tx_id.clone();
        trade.payout_tx_hash = Some(payout.hash);
        trade.payout_tx_hex = Some(payout.hex);
        trade.advance_state(State::BuyerSentPaymentSentMsg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use escrow_types::OfferDirection;

    #[test]
    fn test_confirm_pipelines_gate_on_phase() {
        let sent = payment_sent_pipeline(None);
        let received = payment_received_pipeline();
        assert_eq!(sent.name, "ConfirmPaymentSent");
        assert!(sent.tasks.len() == 2 && received.tasks.len() == 2);
        assert!(sent.wait_for.is_none());
    }

    #[test]
    fn test_seller_ignores_repeated_payment_sent() {
        let pipeline = seller_payment_sent_pipeline(Role::Taker);
        let mut trade = sample_trade(OfferDirection::Buy, Role::Taker);
        assert!(!pipeline.condition.should_ignore(&trade));
        trade.set_state(State::SellerReceivedPaymentSentMsg);
        assert!(pipeline.condition.should_ignore(&trade));
        trade.set_state(State::PayoutPublished);
        assert!(pipeline.condition.should_ignore(&trade));
    }

    #[tokio::test]
    async fn test_payment_sent_requires_peer_multisig_info() {
        let services = crate::protocol::test_support::test_services("buyer");
        let trade = sample_trade(OfferDirection::Buy, Role::Maker);
        assert!(matches!(
            import_peer_multisig(&trade, &services).await,
            Err(ProtocolError::MissingData(_))
        ));
    }
}
