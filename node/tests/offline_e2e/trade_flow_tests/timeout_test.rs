//! Protocol Timeouts
//!
//! A trade that cannot publish its deposits within the window fails with an
//! explicit timeout. Once deposits are out, the window no longer applies.

use crate::mock_infrastructure::*;
use escrow_node::{Phase, ProtocolConfig, State};
use escrow_types::OfferDirection;
use std::time::Duration;
use tokio::time::sleep;

fn short_window() -> ProtocolConfig {
    ProtocolConfig {
        trade_timeout: Duration::from_secs(1),
        ..test_config()
    }
}

#[tokio::test]
async fn test_unreachable_arbitrator_fails_trade() {
    let net = TradeNetwork::start_with(short_window()).await;
    net.network.set_online(net.arbitrator.address(), false);

    let offer = net.create_offer(OfferDirection::Sell).await;
    // The request itself reaches the maker; the failure comes later
    let _ = net.taker.node.take_offer(offer.clone(), offer.amount).await;

    for party in [&net.taker, &net.maker] {
        let trade = net
            .wait_until(party, &offer.id, "failed trade", |t| t.is_failed())
            .await;
        assert_eq!(trade.phase(), Phase::Init);
        assert!(trade.state() < State::MultisigCompleted);
        assert!(trade.error_message.is_some());
        assert!(trade.failed_at.is_some());
    }
    let taker = net.taker.trade(&offer.id).await;
    assert!(
        taker
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("Timeout reached"),
        "unexpected error: {:?}",
        taker.error_message
    );

    net.shutdown().await;
}

#[tokio::test]
async fn test_published_deposits_stop_the_clock() {
    let net = TradeNetwork::start_with(short_window()).await;
    let trade_id = net.run_to_deposits_unlocked().await;

    sleep(Duration::from_secs(2)).await;
    for party in net.parties() {
        let trade = party.trade(&trade_id).await;
        assert!(!trade.is_failed(), "{} failed: {:?}", party.label, trade.error_message);
        assert_eq!(trade.phase(), Phase::DepositsUnlocked);
    }

    net.shutdown().await;
}
