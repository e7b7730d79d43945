//! Refund track
//!
//! The arbitrator rules with its multisig share already on the payout. Either
//! trader adds the second signature and publishes; publishing twice is
//! harmless since both end up with the same transaction.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::dispute_manager::{DisputeManager, DisputeTrack};
use crate::error::{SupportError, SupportResult};
use crate::models::{DisputeResult, DisputeState, PayoutState, SupportType, Trade};
use crate::protocol::messages::DisputeClosedMessage;
use crate::protocol::tasks::payment::{import_peer_multisig, publish_payout};
use crate::protocol::ProtocolServices;
use crate::services::trade_manager::TradeManager;

pub struct RefundTrack;

impl RefundTrack {
    pub fn manager(trades: Arc<TradeManager>) -> Arc<DisputeManager> {
        DisputeManager::new(Box::new(RefundTrack), trades)
    }
}

async fn is_relayed(services: &ProtocolServices, hash: &str) -> SupportResult<bool> {
    Ok(services
        .daemon
        .get_tx(hash)
        .await?
        .map(|info| info.relayed)
        .unwrap_or(false))
}

/// Co-sign the arbitrator's payout and publish it, unless it is already out
async fn complete_refund_payout(
    trade: &mut Trade,
    services: &ProtocolServices,
    payout_tx_hex: &str,
    result: &DisputeResult,
) -> SupportResult<()> {
    let payout = services.wallet.describe_payout_tx(payout_tx_hex).await?;
    let destinations =
        trade.payout_destinations(result.buyer_payout_amount, result.seller_payout_amount)?;
    if !payout.matches_destinations(&destinations) {
        return Err(SupportError::InvalidResult(
            "refund payout does not match the result".to_string(),
        ));
    }

    if !is_relayed(services, &payout.hash).await? {
        let published = async {
            import_peer_multisig(trade, services).await?;
            let signed = services.wallet.sign_multisig_tx(&trade.id, payout_tx_hex).await?;
            publish_payout(trade, services, &signed.hex).await?;
            SupportResult::Ok(())
        }
        .await;
        if let Err(e) = published {
            // The other trader may have won the race
            if !is_relayed(services, &payout.hash).await? {
                return Err(e);
            }
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                error = %e,
                "Refund payout already published by the peer"
            );
        }
    }

    trade.payout_tx_hash = Some(payout.hash);
    trade.payout_tx_hex.get_or_insert_with(|| payout.hex);
    trade.set_payout_state(PayoutState::PayoutPublished);
    Ok(())
}

#[async_trait]
impl DisputeTrack for RefundTrack {
    fn support_type(&self) -> SupportType {
        SupportType::Refund
    }

    fn requested_state(&self) -> DisputeState {
        DisputeState::RefundRequested
    }

    fn started_by_peer_state(&self) -> DisputeState {
        DisputeState::RefundRequestStartedByPeer
    }

    async fn agent_payout(
        &self,
        trade: &mut Trade,
        services: &ProtocolServices,
        result: &DisputeResult,
    ) -> SupportResult<Option<String>> {
        if trade.payout_state >= PayoutState::PayoutPublished {
            info!(
                trade_id = %crate::log_trade_id!(&trade.id),
                "Trade already paid out, closing without a refund payout"
            );
            return Ok(None);
        }
        import_peer_multisig(trade, services).await?;
        let destinations =
            trade.payout_destinations(result.buyer_payout_amount, result.seller_payout_amount)?;
        let payout = services.wallet.create_payout_tx(&trade.id, &destinations).await?;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            txid = %crate::log_txid!(&payout.hash),
            "Refund payout signed"
        );
        trade.payout_tx_hash = Some(payout.hash);
        trade.payout_tx_hex = Some(payout.hex.clone());
        Ok(Some(payout.hex))
    }

    fn agent_closed(&self, trade: &mut Trade) {
        trade.mark_closed();
    }

    async fn apply_result(
        &self,
        trade: &mut Trade,
        services: &ProtocolServices,
        message: &DisputeClosedMessage,
    ) -> SupportResult<()> {
        trade.set_dispute_state(DisputeState::RefundRequestClosed);
        if let Some(payout_tx_hex) = &message.payout_tx_hex {
            complete_refund_payout(trade, services, payout_tx_hex, &message.result).await?;
        }
        trade.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use crate::models::Role;
    use crate::protocol::test_support::test_services;
    use escrow_types::OfferDirection;

    #[tokio::test]
    async fn test_settled_trade_gets_no_refund_payout() {
        let services = test_services("arbitrator");
        let mut trade = sample_trade(OfferDirection::Buy, Role::Arbitrator);
        trade.set_payout_state(PayoutState::PayoutPublished);
        let result = DisputeResult {
            trade_id: trade.id.clone(),
            trader_id: "abcd".into(),
            winner: crate::models::Winner::Buyer,
            reason: crate::models::DisputeReason::TradeAlreadySettled,
            summary_notes: String::new(),
            buyer_payout_amount: 1,
            seller_payout_amount: 1,
            close_date: chrono::Utc::now(),
            agent_signature: None,
            agent_pub_key_ring: services.pub_key_ring.clone(),
        };
        let payout = RefundTrack.agent_payout(&mut trade, &services, &result).await.unwrap();
        assert!(payout.is_none());
    }

    #[tokio::test]
    async fn test_refund_payout_needs_peer_multisig_info() {
        let services = test_services("arbitrator");
        let mut trade = sample_trade(OfferDirection::Sell, Role::Arbitrator);
        let result = DisputeResult {
            trade_id: trade.id.clone(),
            trader_id: "abcd".into(),
            winner: crate::models::Winner::Seller,
            reason: crate::models::DisputeReason::NoReply,
            summary_notes: "buyer never paid".into(),
            buyer_payout_amount: 0,
            seller_payout_amount: 2,
            close_date: chrono::Utc::now(),
            agent_signature: None,
            agent_pub_key_ring: services.pub_key_ring.clone(),
        };
        assert!(RefundTrack.agent_payout(&mut trade, &services, &result).await.is_err());
    }
}
