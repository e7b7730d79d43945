//! Lost ACK and Retry
//!
//! The seller's ACK for the payment sent message never reaches the buyer.
//! The buyer resends with the same uid on its next poll; the seller only
//! re-acknowledges, and exactly one payout leaves the multisig.

use crate::mock_infrastructure::*;
use escrow_node::{Role, State};

#[tokio::test]
async fn test_resent_payment_sent_is_acked_once_applied() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    net.network.set_drop_filter(drop_first_ack(
        net.maker.address().clone(),
        net.taker.address().clone(),
        "PaymentSentMessage",
    ));

    net.taker
        .node
        .confirm_payment_sent(&trade_id, None)
        .await
        .expect("payment sent");
    net.wait_for_state(&net.maker, &trade_id, State::SellerReceivedPaymentSentMsg)
        .await;

    // Polling resends until the seller's second ACK gets through
    let buyer = net
        .wait_until(&net.taker, &trade_id, "seller ACK", |t| {
            t.peer(Role::Maker).is_acked("PaymentSentMessage")
        })
        .await;
    assert!(buyer.state() >= State::BuyerSawArrivedPaymentSentMsg);
    assert_eq!(net.network.dropped_count(), 1);

    let uid = buyer
        .process_model
        .payment_sent_message
        .as_ref()
        .map(|m| m.header.uid.clone())
        .expect("payment sent message kept");
    let seller = net.maker.trade(&trade_id).await;
    assert_eq!(seller.state(), State::SellerReceivedPaymentSentMsg);
    assert!(seller.process_model.is_processed(&uid));

    net.maker
        .node
        .confirm_payment_received(&trade_id)
        .await
        .expect("payment received");
    net.chain
        .mine_blocks(net.config.payout_confirmations_for_completed);
    for party in [&net.maker, &net.taker] {
        net.wait_for_state(party, &trade_id, State::TradeCompleted)
            .await;
    }

    let multisig = net.multisig_address(&trade_id).await;
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 1);

    net.shutdown().await;
}

#[tokio::test]
async fn test_confirmations_respect_side_and_phase() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    // Nothing to receive before the buyer reports payment
    assert!(net.maker.node.confirm_payment_received(&trade_id).await.is_err());
    assert!(net.maker.node.confirm_payment_sent(&trade_id, None).await.is_err());
    assert!(net.taker.node.confirm_payment_received(&trade_id).await.is_err());
    assert_eq!(
        net.maker.trade(&trade_id).await.state(),
        State::DepositTxsUnlockedInBlockchain
    );

    net.taker
        .node
        .confirm_payment_sent(&trade_id, None)
        .await
        .expect("payment sent");
    net.wait_for_state(&net.maker, &trade_id, State::SellerReceivedPaymentSentMsg)
        .await;
    net.maker
        .node
        .confirm_payment_received(&trade_id)
        .await
        .expect("payment received");

    net.shutdown().await;
}
