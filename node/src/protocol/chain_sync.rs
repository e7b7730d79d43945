//! Daemon polling for deposit and payout progress

use tracing::{debug, info};

use super::outbox::{send_to_peer, SendMode};
use super::ProtocolServices;
use crate::error::ProtocolResult;
use crate::models::{PayoutState, Role, State, Trade};

/// Advance the deposit states from the confirmations of both deposits
pub async fn sync_deposits(trade: &mut Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    if trade.state() < State::ContractSigned
        || trade.state() >= State::DepositTxsUnlockedInBlockchain
    {
        return Ok(());
    }
    let (Some(maker_hash), Some(taker_hash)) = (
        trade.peer(Role::Maker).deposit_tx_hash.clone(),
        trade.peer(Role::Taker).deposit_tx_hash.clone(),
    ) else {
        return Ok(());
    };

    let mut confirmations = u64::MAX;
    for hash in [&maker_hash, &taker_hash] {
        match services.daemon.get_tx(hash).await? {
            Some(info) if info.relayed => confirmations = confirmations.min(info.confirmations),
            _ => return Ok(()),
        }
    }

    let config = &services.config;
    let target = if confirmations >= config.confirmations_for_unlocked {
        State::DepositTxsUnlockedInBlockchain
    } else if confirmations >= config.confirmations_for_confirmed {
        State::DepositTxsConfirmedInBlockchain
    } else {
        State::DepositTxsSeenInNetwork
    };
    if target > trade.state() {
        debug!(
            trade_id = %crate::log_trade_id!(&trade.id),
            confirmations,
            "Deposits progressed on chain"
        );
        // Intermediate states keep the progression observable
        for state in [
            State::DepositTxsSeenInNetwork,
            State::DepositTxsConfirmedInBlockchain,
            State::DepositTxsUnlockedInBlockchain,
        ] {
            if state <= target {
                trade.set_state(state);
            }
        }
    }
    Ok(())
}

/// Track the payout once its hash is known
pub async fn sync_payout(trade: &mut Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    let Some(hash) = trade.payout_tx_hash.clone() else {
        return Ok(());
    };
    let Some(info) = services.daemon.get_tx(&hash).await? else {
        return Ok(());
    };
    if !info.relayed {
        return Ok(());
    }

    if trade.payout_state < PayoutState::PayoutPublished {
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            txid = %crate::log_txid!(&hash),
            "Payout seen in network"
        );
        trade.set_payout_state(PayoutState::PayoutPublished);
    }
    trade.set_state(State::PayoutPublished);

    if info.confirmations >= services.config.payout_confirmations_for_completed {
        trade.set_payout_state(PayoutState::PayoutConfirmed);
        trade.set_state(State::TradeCompleted);
    }
    Ok(())
}

/// Resend stored payment messages to parties that have not acknowledged them.
/// The uid is unchanged so a receiver that already applied one only re-ACKs.
pub async fn resend_unacked(trade: &mut Trade, services: &ProtocolServices) {
    if trade.payout_state >= PayoutState::PayoutPublished {
        return;
    }

    if trade.is_buyer() && !trade.process_model.payment_sent_message_acked {
        if let Some(message) = trade.process_model.payment_sent_message.clone() {
            let class_name = "PaymentSentMessage";
            for role in [trade.seller_role(), Role::Arbitrator] {
                if !trade.peer(role).is_acked(class_name) {
                    resend(trade, services, role, message.clone(), class_name).await;
                }
            }
        }
    }

    if trade.is_seller() && !trade.process_model.payment_received_message_acked {
        if let Some(message) = trade.process_model.payment_received_message.clone() {
            let class_name = "PaymentReceivedMessage";
            for role in [trade.buyer_role(), Role::Arbitrator] {
                if !trade.peer(role).is_acked(class_name) {
                    resend(trade, services, role, message.clone(), class_name).await;
                }
            }
        }
    }
}

async fn resend(
    trade: &Trade,
    services: &ProtocolServices,
    role: Role,
    message: impl Into<crate::protocol::messages::Message>,
    class_name: &'static str,
) {
    debug!(
        trade_id = %crate::log_trade_id!(&trade.id),
        to = %role,
        message = class_name,
        "Resending unacknowledged message"
    );
    // Failures are logged by the outbox and retried on the next poll
    let _ = send_to_peer(services, trade, role, message, SendMode::Mailbox).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use crate::protocol::test_support::test_services_on;
    use crate::p2p::LocalNetwork;
    use escrow_types::OfferDirection;
    use escrow_wallet::{Daemon, OfflineChain, OfflineWallet, TradeWallet};
    use std::sync::Arc;

    async fn relayed_deposit(chain: &Arc<OfflineChain>, label: &str) -> String {
        let wallet = OfflineWallet::new(label, chain.clone());
        chain.fund(&wallet.primary_address(), 10_000_000_000_000);
        let deposit = wallet
            .create_deposit_tx("trade", "4multisig", "fee", 10, 1_000)
            .await
            .unwrap();
        chain.submit_tx_hex(&deposit.hex, false).await.unwrap();
        deposit.hash
    }

    #[tokio::test]
    async fn test_deposit_states_follow_confirmations() {
        let chain = Arc::new(OfflineChain::new());
        let services = test_services_on("arbitrator", chain.clone(), LocalNetwork::new());
        let mut trade = sample_trade(OfferDirection::Buy, Role::Arbitrator);
        trade.set_state(State::ContractSigned);
        trade.peer_mut(Role::Maker).deposit_tx_hash = Some(relayed_deposit(&chain, "maker").await);

        // Only one deposit known: nothing moves
        sync_deposits(&mut trade, &services).await.unwrap();
        assert_eq!(trade.state(), State::ContractSigned);

        trade.peer_mut(Role::Taker).deposit_tx_hash = Some(relayed_deposit(&chain, "taker").await);
        sync_deposits(&mut trade, &services).await.unwrap();
        assert_eq!(trade.state(), State::DepositTxsSeenInNetwork);

        chain.mine_blocks(1);
        sync_deposits(&mut trade, &services).await.unwrap();
        assert_eq!(trade.state(), State::DepositTxsConfirmedInBlockchain);

        chain.mine_blocks(services.config.confirmations_for_unlocked);
        sync_deposits(&mut trade, &services).await.unwrap();
        assert_eq!(trade.state(), State::DepositTxsUnlockedInBlockchain);
    }

    #[tokio::test]
    async fn test_unknown_payout_leaves_trade_alone() {
        let services = test_services_on("taker", Arc::new(OfflineChain::new()), LocalNetwork::new());
        let mut trade = sample_trade(OfferDirection::Buy, Role::Taker);
        trade.payout_tx_hash = Some("missing".into());
        sync_payout(&mut trade, &services).await.unwrap();
        assert_eq!(trade.payout_state, PayoutState::PayoutUnpublished);
        assert_eq!(trade.state(), State::Preparation);
    }
}
