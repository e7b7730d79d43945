//! Deposit Relay Atomicity
//!
//! The arbitrator relays both deposits or neither. A taker deposit that is
//! one atomic unit short fails verification, and the maker's valid deposit
//! must stay off the network.

use crate::mock_infrastructure::*;
use escrow_node::{Phase, Role, State};
use escrow_types::OfferDirection;

#[tokio::test]
async fn test_short_taker_deposit_relays_nothing() {
    let net = TradeNetwork::start().await;
    net.taker.wallet.understate_next_deposit_by(1);

    let offer = net.create_offer(OfferDirection::Sell).await;
    let trade_id = net.take(&offer).await;

    let taker = net
        .wait_until(&net.taker, &trade_id, "failed deposit request", |t| t.is_failed())
        .await;
    assert_eq!(taker.state(), State::PublishDepositTxRequestFailed);
    let error = taker.error_message.clone().unwrap_or_default();
    assert!(error.contains("DepositRequest"), "unexpected error: {error}");

    // Whatever the arrival order, neither deposit made it out
    let maker = net
        .wait_until(&net.maker, &trade_id, "own deposit", |t| {
            t.self_peer().deposit_tx_hash.is_some()
        })
        .await;
    let maker_deposit = maker.self_peer().deposit_tx_hash.clone().unwrap();
    let taker_deposit = taker.self_peer().deposit_tx_hash.clone().unwrap();
    assert!(!net.chain.is_relayed(&maker_deposit));
    assert!(!net.chain.is_relayed(&taker_deposit));

    let arbitrator = net.arbitrator.trade(&trade_id).await;
    assert!(arbitrator.state() < State::ArbitratorPublishedDepositTxs);
    assert_eq!(arbitrator.phase(), Phase::Init);
    assert!(arbitrator.error_message.is_some());

    net.shutdown().await;
}

#[tokio::test]
async fn test_rejected_submission_relays_nothing() {
    let net = TradeNetwork::start().await;
    // The first deposit the arbitrator submits is refused by the daemon
    net.chain.reject_next_submission("daemon busy");

    let offer = net.create_offer(OfferDirection::Sell).await;
    let trade_id = net.take(&offer).await;

    let arbitrator = net
        .wait_until(&net.arbitrator, &trade_id, "publication error", |t| {
            t.error_message.is_some()
        })
        .await;
    assert!(arbitrator.state() < State::ArbitratorPublishedDepositTxs);

    for role in [Role::Maker, Role::Taker] {
        if let Some(hash) = arbitrator.peer(role).deposit_tx_hash.as_deref() {
            assert!(!net.chain.is_relayed(hash), "{role} deposit relayed");
        }
    }

    net.shutdown().await;
}
