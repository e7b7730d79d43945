//! Happy Path
//!
//! Maker sells 1.0 to the taker. Multisig, contract, deposits, payment and
//! a cooperatively signed payout, ending with every party completed.

use crate::mock_infrastructure::*;
use escrow_node::{DisputeState, PayoutState, Phase, Role, State};
use escrow_types::OfferDirection;
use escrow_wallet::TradeWallet;

#[tokio::test]
async fn test_sell_offer_trade_completes() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;
    let trade_id = net.take(&offer).await;
    assert_eq!(trade_id, offer.id);

    // All three build the same multisig wallet
    let mut addresses = Vec::new();
    for party in net.parties() {
        let trade = net
            .wait_for_state(party, &trade_id, State::MultisigCompleted)
            .await;
        addresses.push(
            trade
                .process_model
                .multisig_address()
                .expect("multisig address")
                .to_string(),
        );
    }
    assert!(addresses.iter().all(|a| a == &addresses[0]));

    // Arbitrator relays both deposits
    let arbitrator = net
        .wait_for_state(&net.arbitrator, &trade_id, State::ArbitratorPublishedDepositTxs)
        .await;
    for role in [Role::Maker, Role::Taker] {
        let hash = arbitrator
            .peer(role)
            .deposit_tx_hash
            .clone()
            .expect("deposit hash");
        assert!(net.chain.is_relayed(&hash), "{role} deposit not relayed");
    }

    net.chain.mine_blocks(net.config.confirmations_for_unlocked);
    let buyer = net
        .wait_for_state(&net.taker, &trade_id, State::DepositTxsUnlockedInBlockchain)
        .await;
    assert!(buyer.is_buyer());
    net.wait_for_state(&net.maker, &trade_id, State::DepositTxsUnlockedInBlockchain)
        .await;

    // Buyer learns the seller's payment account once deposits confirm
    let buyer = net
        .wait_until(&net.taker, &trade_id, "seller payment account", |t| {
            t.peer(Role::Maker).payment_account_payload.is_some()
        })
        .await;
    assert_eq!(
        buyer.peer(Role::Maker).payment_account_payload,
        Some(payment_account("maker"))
    );

    net.taker
        .node
        .confirm_payment_sent(&trade_id, Some("sepa-ref-001".to_string()))
        .await
        .expect("payment sent");
    net.wait_for_state(&net.taker, &trade_id, State::BuyerSawArrivedPaymentSentMsg)
        .await;
    let seller = net
        .wait_for_state(&net.maker, &trade_id, State::SellerReceivedPaymentSentMsg)
        .await;
    assert_eq!(seller.counter_currency_tx_id.as_deref(), Some("sepa-ref-001"));

    let seller_before = net.chain.balance(&net.maker.wallet.primary_address());
    let buyer_before = net.chain.balance(&net.taker.wallet.primary_address());
    net.maker
        .node
        .confirm_payment_received(&trade_id)
        .await
        .expect("payment received");

    net.chain
        .mine_blocks(net.config.payout_confirmations_for_completed);
    for party in net.parties() {
        let trade = net
            .wait_for_state(party, &trade_id, State::TradeCompleted)
            .await;
        assert_eq!(trade.phase(), Phase::Completed);
        assert_eq!(trade.payout_state, PayoutState::PayoutConfirmed);
        assert_eq!(trade.dispute_state, DisputeState::NoDispute);
        assert!(trade.is_completed());
        assert!(trade.error_message.is_none());
    }

    let multisig = net.multisig_address(&trade_id).await;
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 1);

    let seller = net.maker.trade(&trade_id).await;
    assert!(net.chain.balance(&net.maker.wallet.primary_address()) > seller_before);
    assert!(
        net.chain.balance(&net.taker.wallet.primary_address())
            > buyer_before + seller.amount / 2
    );

    net.shutdown().await;
}

#[tokio::test]
async fn test_buy_offer_swaps_sides() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Buy).await;
    let trade_id = net.take(&offer).await;

    for party in net.parties() {
        net.wait_for_state(party, &trade_id, State::ArbitratorPublishedDepositTxs)
            .await;
    }
    let maker = net.maker.trade(&trade_id).await;
    let taker = net.taker.trade(&trade_id).await;
    assert!(maker.is_buyer());
    assert!(taker.is_seller());
    assert_eq!(maker.seller_role(), Role::Taker);

    net.shutdown().await;
}
