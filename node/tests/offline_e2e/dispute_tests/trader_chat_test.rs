//! Trader Chat
//!
//! Maker and taker talk directly while their trade is open. Lines are kept
//! once per uid, acknowledged by the receiver and refused once the trade is
//! over. The arbitrator has no seat in this chat.

use crate::mock_infrastructure::*;
use escrow_node::models::SupportType;
use escrow_node::p2p::InboundHandler;
use escrow_node::protocol::messages::{ChatMessage, Envelope, MessageHeader};
use escrow_node::{ProtocolConfig, State, SupportError};
use escrow_types::OfferDirection;
use std::time::Duration;

fn chat_from(party: &TestParty, trade_id: &str, text: &str) -> Envelope {
    let message = ChatMessage::new(
        MessageHeader::new(trade_id, party.address()),
        SupportType::Trade,
        text,
        true,
    );
    Envelope::new(
        party.address().clone(),
        party.node.pub_key_ring().clone(),
        message.into(),
    )
}

fn lines(messages: &[ChatMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter(|m| !m.system_message)
        .map(|m| m.text.as_str())
        .collect()
}

#[tokio::test]
async fn test_traders_chat_while_trade_is_open() {
    let net = TradeNetwork::start().await;
    let offer = net.create_offer(OfferDirection::Sell).await;
    let trade_id = net.take(&offer).await;
    net.wait_for_state(&net.maker, &trade_id, State::MultisigCompleted)
        .await;

    let sent = net
        .taker
        .node
        .send_chat_message(&trade_id, SupportType::Trade, "Sending the transfer today")
        .await
        .expect("chat sent");
    assert!(sent.arrived);

    let maker = net
        .wait_until(&net.maker, &trade_id, "taker chat", |t| {
            lines(&t.chat_messages) == ["Sending the transfer today"]
        })
        .await;
    assert!(maker.chat_messages[0].system_message);

    let taker = net
        .wait_until(&net.taker, &trade_id, "chat ACK", |t| {
            t.chat_messages
                .iter()
                .any(|m| m.header.uid == sent.header.uid && m.acknowledged)
        })
        .await;
    assert_eq!(taker.chat_messages.iter().filter(|m| m.system_message).count(), 1);

    net.maker
        .node
        .send_chat_message(&trade_id, SupportType::Trade, "Thanks")
        .await
        .expect("reply sent");
    net.wait_until(&net.taker, &trade_id, "maker reply", |t| {
        lines(&t.chat_messages) == ["Sending the transfer today", "Thanks"]
    })
    .await;

    // Redelivery keeps one copy
    let envelope = chat_from(&net.taker, &trade_id, "Once only");
    net.maker.node.on_direct_message(envelope.clone()).await;
    net.maker.node.on_direct_message(envelope).await;
    let maker = net.maker.trade(&trade_id).await;
    assert_eq!(
        lines(&maker.chat_messages).iter().filter(|l| **l == "Once only").count(),
        1
    );

    assert!(matches!(
        net.arbitrator
            .node
            .send_chat_message(&trade_id, SupportType::Trade, "hello")
            .await,
        Err(SupportError::ChatClosed(_))
    ));
    // Not a trader of this trade: dropped with a NACK
    net.maker
        .node
        .on_direct_message(chat_from(&net.arbitrator, &trade_id, "let me in"))
        .await;
    let maker = net.maker.trade(&trade_id).await;
    assert!(!lines(&maker.chat_messages).contains(&"let me in"));
    assert!(net.arbitrator.trade(&trade_id).await.chat_messages.is_empty());
    assert_eq!(net.taker.node.trader_chat_messages(&trade_id).await.len(), 3);

    net.shutdown().await;
}

#[tokio::test]
async fn test_chat_closes_with_the_trade() {
    let config = ProtocolConfig {
        trade_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let net = TradeNetwork::start_with(config).await;
    net.network.set_online(net.arbitrator.address(), false);
    let offer = net.create_offer(OfferDirection::Sell).await;
    let _ = net.taker.node.take_offer(offer.clone(), offer.amount).await;

    for party in [&net.taker, &net.maker] {
        net.wait_until(party, &offer.id, "failed trade", |t| t.is_failed())
            .await;
    }

    assert!(matches!(
        net.taker
            .node
            .send_chat_message(&offer.id, SupportType::Trade, "still there?")
            .await,
        Err(SupportError::ChatClosed(_))
    ));
    net.maker
        .node
        .on_direct_message(chat_from(&net.taker, &offer.id, "still there?"))
        .await;
    assert!(net.maker.trade(&offer.id).await.chat_messages.is_empty());

    net.shutdown().await;
}
