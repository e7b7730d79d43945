//! Multisig Round Delivery
//!
//! A multisig update has to reach both other parties. With the taker
//! unreachable for the multisig round, neither the arbitrator nor the maker
//! gets past preparing.

use crate::mock_infrastructure::*;
use escrow_node::{Phase, State};
use escrow_types::OfferDirection;

#[tokio::test]
async fn test_round_fails_when_a_peer_is_unreachable() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;

    let taker = net.taker.address().clone();
    net.network.set_unreachable_filter(Box::new(move |to, envelope| {
        *to == taker && envelope.message.class_name() == "InitMultisigRequest"
    }));
    net.taker
        .node
        .take_offer(offer.clone(), offer.amount)
        .await
        .expect("trade request reaches the maker");

    for party in [&net.arbitrator, &net.maker] {
        let trade = net
            .wait_until(party, &offer.id, "failed multisig round", |t| t.is_failed())
            .await;
        assert_eq!(trade.phase(), Phase::Init);
        assert!(trade.state() < State::MultisigCompleted);
        assert!(trade.process_model.multisig_address().is_none());
        assert!(
            trade.error_message.is_some(),
            "{} failed without an error",
            party.label
        );
    }
    let arbitrator = net.arbitrator.trade(&offer.id).await;
    assert!(
        arbitrator
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("offline"),
        "unexpected error: {:?}",
        arbitrator.error_message
    );

    net.shutdown().await;
}
