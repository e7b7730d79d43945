//! Offer Reservation
//!
//! A trade request with bad terms must not use up the maker's offer. The
//! offer is back on the book once the request fails, and a genuine taker can
//! still take it.

use crate::mock_infrastructure::*;
use escrow_node::p2p::InboundHandler;
use escrow_node::protocol::messages::{Envelope, InitTradeRequest, MessageHeader};
use escrow_node::State;
use escrow_types::{KeyRing, NodeAddress, Offer, OfferDirection};

fn request_with_zero_fee(offer: &Offer, from: &NodeAddress, key_ring: &KeyRing) -> Envelope {
    let request = InitTradeRequest {
        header: MessageHeader::new(&offer.id, from),
        offer: offer.clone(),
        trade_amount: offer.amount,
        price: offer.price,
        maker_node_address: offer.maker_node_address.clone(),
        maker_pub_key_ring: offer.maker_pub_key_ring.clone(),
        taker_node_address: from.clone(),
        taker_pub_key_ring: key_ring.pub_key_ring(),
        taker_fee: 0,
        payment_account_id: "acct-stranger".to_string(),
        payment_account_payload_hash: "00".repeat(32),
    };
    Envelope::new(from.clone(), key_ring.pub_key_ring(), request.into())
}

#[tokio::test]
async fn test_rejected_request_reopens_offer() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;

    let stranger = KeyRing::generate();
    let stranger_address = NodeAddress::new("stranger.onion:9999");
    net.maker
        .node
        .on_direct_message(request_with_zero_fee(&offer, &stranger_address, &stranger))
        .await;

    let open = net.maker.node.trade_manager().open_offers().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, offer.id);
    assert!(net.maker.node.trade(&offer.id).await.is_none());

    let trade_id = net.take(&offer).await;
    for party in net.parties() {
        let trade = net
            .wait_for_state(party, &trade_id, State::MultisigCompleted)
            .await;
        assert!(!trade.is_failed(), "{} failed: {:?}", party.label, trade.error_message);
    }
    assert!(net.maker.node.trade_manager().open_offers().await.is_empty());

    net.shutdown().await;
}
