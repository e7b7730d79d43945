//! Mailbox Ordering
//!
//! Messages held for an offline node come back as one batch. The batch is
//! applied in causal order whatever order it was stored in.

use crate::mock_infrastructure::*;
use escrow_node::models::{DisputeReason, SupportType, Winner};
use escrow_node::p2p::InboundHandler;
use escrow_node::support::DisputeDecision;
use escrow_node::{DisputeState, PayoutState, State};

const HELD_FOR_SELLER: &[&str] = &[
    "PaymentSentMessage",
    "PeerOpenedDisputeMessage",
    "DisputeClosedMessage",
];

#[tokio::test]
async fn test_offline_seller_gets_payment_sent_on_reconnect() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    net.network.set_online(net.maker.address(), false);
    net.taker
        .node
        .confirm_payment_sent(&trade_id, None)
        .await
        .expect("payment sent");
    let buyer = net.taker.trade(&trade_id).await;
    assert_eq!(buyer.state(), State::BuyerStoredInMailboxPaymentSentMsg);
    assert!(net.network.mailbox_len(net.maker.address()) >= 1);

    net.network.set_online(net.maker.address(), true);
    net.wait_for_state(&net.maker, &trade_id, State::SellerReceivedPaymentSentMsg)
        .await;
    net.wait_for_state(&net.taker, &trade_id, State::BuyerSawArrivedPaymentSentMsg)
        .await;
    assert_eq!(net.network.mailbox_len(net.maker.address()), 0);

    net.shutdown().await;
}

#[tokio::test]
async fn test_dispute_closed_before_payment_sent_is_reordered() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    let capture = MessageCapture::new();
    net.network
        .set_drop_filter(capture.filter(net.maker.address().clone(), HELD_FOR_SELLER));

    net.taker
        .node
        .confirm_payment_sent(&trade_id, None)
        .await
        .expect("payment sent");
    net.taker
        .node
        .open_dispute(&trade_id, SupportType::Refund)
        .await
        .expect("refund dispute opened");
    let arbitrator = net
        .wait_until(&net.arbitrator, &trade_id, "refund dispute", |t| {
            t.dispute(SupportType::Refund).is_some()
        })
        .await;

    let decision = DisputeDecision {
        winner: Winner::Buyer,
        reason: DisputeReason::SellerNotResponding,
        summary_notes: "Seller never confirmed".to_string(),
        buyer_payout_amount: arbitrator.amount
            + arbitrator.buyer_security_deposit
            + arbitrator.seller_security_deposit / 2,
        seller_payout_amount: arbitrator.seller_security_deposit / 2,
    };
    net.arbitrator
        .node
        .close_dispute(&trade_id, SupportType::Refund, decision)
        .await
        .expect("refund dispute closed");
    net.wait_until(&net.taker, &trade_id, "refund payout", |t| t.is_closed())
        .await;

    // Hand the seller its held messages newest first
    let classes = capture.classes();
    let mut held = capture.take();
    assert_eq!(held.len(), 3, "held {classes:?}");
    held.reverse();
    assert_eq!(held[0].message.class_name(), "DisputeClosedMessage");
    net.network.clear_drop_filter();
    net.maker.node.on_mailbox_messages(held).await;

    let seller = net
        .wait_until(&net.maker, &trade_id, "closed trade", |t| t.is_closed())
        .await;
    assert_eq!(seller.state(), State::SellerReceivedPaymentSentMsg);
    assert_eq!(seller.dispute_state, DisputeState::RefundRequestClosed);
    assert_eq!(seller.payout_state, PayoutState::PayoutPublished);
    assert!(seller.dispute(SupportType::Refund).is_some_and(|d| d.is_closed()));

    let multisig = net.multisig_address(&trade_id).await;
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 1);

    net.shutdown().await;
}
