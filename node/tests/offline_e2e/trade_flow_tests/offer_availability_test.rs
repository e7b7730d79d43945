//! Offer Availability
//!
//! The taker asks the maker before taking. Only an open offer at the maker's
//! price and within its amount range can be taken; everything else is
//! refused before the taker registers a trade.

use crate::mock_infrastructure::*;
use escrow_node::protocol::messages::AvailabilityResult;
use escrow_node::{ProtocolError, State};
use escrow_types::OfferDirection;

#[tokio::test]
async fn test_offer_is_refused_once_taken() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;

    assert_eq!(
        net.taker
            .node
            .check_offer_availability(&offer, offer.amount)
            .await
            .expect("maker answers"),
        AvailabilityResult::Available
    );

    let mut repriced = offer.clone();
    repriced.price += 1;
    assert_eq!(
        net.taker
            .node
            .check_offer_availability(&repriced, offer.amount)
            .await
            .expect("maker answers"),
        AvailabilityResult::PriceMismatch
    );

    let mut unknown = offer.clone();
    unknown.id = uuid::Uuid::new_v4().to_string();
    assert!(matches!(
        net.taker.node.take_offer(unknown.clone(), offer.amount).await,
        Err(ProtocolError::OfferNotAvailable(AvailabilityResult::OfferRemoved))
    ));
    assert!(net.taker.node.trade(&unknown.id).await.is_none());

    let trade_id = net.take(&offer).await;
    net.wait_for_state(&net.maker, &trade_id, State::MultisigCompleted)
        .await;

    // A second taker is turned away before it registers anything
    assert!(matches!(
        net.arbitrator.node.take_offer(offer.clone(), offer.amount).await,
        Err(ProtocolError::OfferNotAvailable(AvailabilityResult::OfferTaken))
    ));
    let arbitrator = net.arbitrator.trade(&trade_id).await;
    assert!(!arbitrator.is_failed());

    net.shutdown().await;
}

#[tokio::test]
async fn test_offline_maker_cannot_be_taken() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;
    net.network.set_online(net.maker.address(), false);

    assert!(matches!(
        net.taker.node.take_offer(offer.clone(), offer.amount).await,
        Err(ProtocolError::Delivery(_))
    ));
    assert!(net.taker.node.trade(&offer.id).await.is_none());

    net.network.set_online(net.maker.address(), true);
    assert_eq!(net.maker.node.trade_manager().open_offers().await.len(), 1);

    net.shutdown().await;
}
