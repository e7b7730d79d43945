//! Mediation and Refund
//!
//! The buyer asks for mediation and the mediator proposes 70/30. The buyer
//! accepts, the seller rejects: no payout, and the seller takes the trade to
//! the refund agent, whose ruling ends in a single payout.

use crate::mock_infrastructure::*;
use escrow_node::models::{DisputeReason, SupportType, Winner};
use escrow_node::support::DisputeDecision;
use escrow_node::{DisputeState, MediationResultState, PayoutState, SupportError};

fn split(total: u64, buyer_pct: u64) -> (u64, u64) {
    let buyer = total * buyer_pct / 100;
    (buyer, total - buyer)
}

#[tokio::test]
async fn test_rejected_mediation_escalates_to_refund() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    net.taker
        .node
        .open_dispute(&trade_id, SupportType::Mediation)
        .await
        .expect("mediation opened");
    let buyer = net.taker.trade(&trade_id).await;
    assert_eq!(buyer.dispute_state, DisputeState::MediationRequested);
    net.wait_until(&net.maker, &trade_id, "peer mediation", |t| {
        t.dispute_state == DisputeState::MediationStartedByPeer
    })
    .await;
    let mediator = net
        .wait_until(&net.arbitrator, &trade_id, "mediation case", |t| {
            t.dispute(SupportType::Mediation).is_some()
        })
        .await;

    // A second mediation while one is open is refused
    assert!(matches!(
        net.taker.node.open_dispute(&trade_id, SupportType::Mediation).await,
        Err(SupportError::AlreadyOpen(_))
    ));

    let (buyer_amount, seller_amount) = split(mediator.total_escrowed(), 70);
    net.arbitrator
        .node
        .close_dispute(
            &trade_id,
            SupportType::Mediation,
            DisputeDecision {
                winner: Winner::Buyer,
                reason: DisputeReason::BankProblems,
                summary_notes: "Payment delayed by the bank".to_string(),
                buyer_payout_amount: buyer_amount,
                seller_payout_amount: seller_amount,
            },
        )
        .await
        .expect("mediation closed");
    for party in [&net.taker, &net.maker] {
        net.wait_until(party, &trade_id, "mediation result", |t| {
            t.dispute_state == DisputeState::MediationClosed
        })
        .await;
    }

    net.taker
        .node
        .accept_mediation_result(&trade_id)
        .await
        .expect("buyer accepts");
    net.wait_until(&net.maker, &trade_id, "buyer signature", |t| {
        t.mediation_result_state == MediationResultState::ReceivedSigMsg
    })
    .await;
    net.maker
        .node
        .reject_mediation_result(&trade_id)
        .await
        .expect("seller rejects");

    let seller = net.maker.trade(&trade_id).await;
    assert_eq!(
        seller.mediation_result_state,
        MediationResultState::MediationResultRejected
    );
    assert!(!seller.is_closed());
    assert!(net.taker.trade(&trade_id).await.mediation_result_state.has_accepted());
    let multisig = net.multisig_address(&trade_id).await;
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 0);
    // A settled round takes no further votes
    assert!(net.maker.node.accept_mediation_result(&trade_id).await.is_err());

    // Escalate to the refund agent
    net.maker
        .node
        .open_dispute(&trade_id, SupportType::Refund)
        .await
        .expect("refund requested");
    assert_eq!(
        net.maker.trade(&trade_id).await.dispute_state,
        DisputeState::RefundRequested
    );
    net.wait_until(&net.taker, &trade_id, "peer refund request", |t| {
        t.dispute_state == DisputeState::RefundRequestStartedByPeer
    })
    .await;
    // Mediation is over once the refund agent has the case
    assert!(net
        .taker
        .node
        .open_dispute(&trade_id, SupportType::Mediation)
        .await
        .is_err());
    net.wait_until(&net.arbitrator, &trade_id, "refund case", |t| {
        t.dispute(SupportType::Refund).is_some()
    })
    .await;

    net.maker
        .node
        .send_chat_message(&trade_id, SupportType::Refund, "Payment never arrived")
        .await
        .expect("chat sent");
    net.wait_until(&net.arbitrator, &trade_id, "seller chat", |t| {
        t.dispute(SupportType::Refund)
            .is_some_and(|d| d.chat.iter().any(|m| m.text == "Payment never arrived"))
    })
    .await;

    let (buyer_amount, seller_amount) = split(mediator.total_escrowed(), 40);
    let result = net
        .arbitrator
        .node
        .close_dispute(
            &trade_id,
            SupportType::Refund,
            DisputeDecision {
                winner: Winner::Seller,
                reason: DisputeReason::NoReply,
                summary_notes: "No proof of payment".to_string(),
                buyer_payout_amount: buyer_amount,
                seller_payout_amount: seller_amount,
            },
        )
        .await
        .expect("refund closed");
    assert!(result.verify(net.arbitrator.node.pub_key_ring()).is_ok());

    for party in [&net.maker, &net.taker] {
        let trade = net
            .wait_until(party, &trade_id, "refund close", |t| t.is_closed())
            .await;
        assert_eq!(trade.dispute_state, DisputeState::RefundRequestClosed);
        assert_eq!(trade.payout_state, PayoutState::PayoutPublished);
        let dispute = trade.dispute(SupportType::Refund).expect("refund dispute");
        assert_eq!(dispute.result.as_ref(), Some(&result));
    }
    assert!(net.arbitrator.trade(&trade_id).await.is_closed());
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 1);

    net.shutdown().await;
}

#[tokio::test]
async fn test_mediation_accepted_by_both_pays_out() {
    let net = TradeNetwork::start().await;
    let trade_id = net.run_to_deposits_unlocked().await;

    net.maker
        .node
        .open_dispute(&trade_id, SupportType::Mediation)
        .await
        .expect("mediation opened");
    let mediator = net
        .wait_until(&net.arbitrator, &trade_id, "mediation case", |t| {
            t.dispute(SupportType::Mediation).is_some()
        })
        .await;
    let (buyer_amount, seller_amount) = split(mediator.total_escrowed(), 50);
    net.arbitrator
        .node
        .close_dispute(
            &trade_id,
            SupportType::Mediation,
            DisputeDecision {
                winner: Winner::Seller,
                reason: DisputeReason::Other,
                summary_notes: "Split evenly".to_string(),
                buyer_payout_amount: buyer_amount,
                seller_payout_amount: seller_amount,
            },
        )
        .await
        .expect("mediation closed");
    for party in [&net.taker, &net.maker] {
        net.wait_until(party, &trade_id, "mediation result", |t| {
            t.dispute_state == DisputeState::MediationClosed
        })
        .await;
    }

    net.maker
        .node
        .accept_mediation_result(&trade_id)
        .await
        .expect("seller accepts");
    net.wait_until(&net.taker, &trade_id, "seller signature", |t| {
        t.mediation_result_state == MediationResultState::ReceivedSigMsg
    })
    .await;
    net.taker
        .node
        .accept_mediation_result(&trade_id)
        .await
        .expect("buyer accepts and publishes");

    for party in net.parties() {
        let trade = net
            .wait_until(party, &trade_id, "mediated payout", |t| t.is_closed())
            .await;
        assert_eq!(trade.payout_state, PayoutState::PayoutPublished);
    }
    assert_eq!(
        net.taker.trade(&trade_id).await.mediation_result_state,
        MediationResultState::PayoutTxPublished
    );
    let multisig = net.multisig_address(&trade_id).await;
    assert_eq!(net.chain.relayed_payouts_from(&multisig), 1);

    net.shutdown().await;
}
