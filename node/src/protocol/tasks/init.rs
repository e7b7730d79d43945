//! Trade initiation: taker -> maker -> arbitrator

use async_trait::async_trait;
use tracing::info;

use super::multisig::ArbitratorPrepareMultisig;
use crate::config;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{Phase, Role, State, Trade};
use crate::protocol::condition::Condition;
use crate::protocol::messages::{InitTradeRequest, MessageHeader};
use crate::protocol::outbox::{send_to_peer, SendMode};
use crate::protocol::pipeline::{tasks, Pipeline, Task, TaskContext};
use crate::protocol::ProtocolServices;

pub fn take_offer_pipeline() -> Pipeline {
    Pipeline::new(
        "TakeOffer",
        Condition::new().state(&[State::Preparation]),
        tasks![TakerSendInitTradeRequest],
    )
}

pub fn maker_init_pipeline() -> Pipeline {
    Pipeline::new(
        "MakerInitTrade",
        Condition::new()
            .phase(&[Phase::Init])
            .from(&[Role::Taker])
            .ignore_when(already_preparing),
        tasks![MakerProcessInitTradeRequest, MakerSendInitTradeRequest],
    )
}

pub fn arbitrator_init_pipeline() -> Pipeline {
    Pipeline::new(
        "ArbitratorInitTrade",
        Condition::new()
            .phase(&[Phase::Init])
            .from(&[Role::Maker])
            .ignore_when(already_preparing),
        tasks![ArbitratorProcessInitTradeRequest, ArbitratorPrepareMultisig],
    )
}

fn already_preparing(trade: &Trade) -> bool {
    trade.self_peer().prepared_multisig_hex.is_some()
}

/// Record this node's payment account and payout address on its own peer record
fn set_own_account(trade: &mut Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    let account = &services.payment_account;
    let hash = account.hash()?;
    let payout_address = services.wallet.primary_address();
    let own = trade.self_peer_mut();
    own.account_id = Some(account.id.clone());
    own.payment_account_payload_hash = Some(hash);
    own.payment_account_payload = Some(account.clone());
    own.payout_address = Some(payout_address);
    Ok(())
}

/// Terms every receiver of an InitTradeRequest checks against its own view
fn validate_terms(trade: &Trade, request: &InitTradeRequest) -> ProtocolResult<()> {
    if request.offer.id != trade.offer.id {
        return Err(ProtocolError::Verification(format!(
            "request is for offer {}, trade is for {}",
            request.offer.id, trade.offer.id
        )));
    }
    if !trade.offer.is_amount_in_range(request.trade_amount) || request.trade_amount != trade.amount {
        return Err(ProtocolError::Verification(format!(
            "trade amount {} outside offer range {}..={}",
            request.trade_amount, trade.offer.min_amount, trade.offer.amount
        )));
    }
    if request.price != trade.offer.price {
        return Err(ProtocolError::Verification(format!(
            "price {} differs from offer price {}",
            request.price, trade.offer.price
        )));
    }
    let expected_fee = config::taker_fee(request.trade_amount);
    if request.taker_fee != expected_fee {
        return Err(ProtocolError::Verification(format!(
            "taker fee {} differs from expected {}",
            request.taker_fee, expected_fee
        )));
    }
    if request.maker_pub_key_ring != trade.offer.maker_pub_key_ring {
        return Err(ProtocolError::Verification(
            "maker key ring differs from the offer".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Taker
// ============================================================================

pub struct TakerSendInitTradeRequest;

#[async_trait]
impl Task for TakerSendInitTradeRequest {
    fn name(&self) -> &'static str {
        "TakerSendInitTradeRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if !trade.offer.is_amount_in_range(trade.amount) {
            return Err(ProtocolError::Verification(format!(
                "amount {} outside offer range",
                trade.amount
            )));
        }
        set_own_account(trade, services)?;

        let own = trade.self_peer();
        let request = InitTradeRequest {
            header: MessageHeader::new(&trade.id, &services.node_address),
            offer: trade.offer.clone(),
            trade_amount: trade.amount,
            price: trade.price,
            maker_node_address: trade.offer.maker_node_address.clone(),
            maker_pub_key_ring: trade.offer.maker_pub_key_ring.clone(),
            taker_node_address: services.node_address.clone(),
            taker_pub_key_ring: services.pub_key_ring.clone(),
            taker_fee: trade.taker_fee,
            payment_account_id: own.account_id.clone().unwrap_or_default(),
            payment_account_payload_hash: own.payment_account_payload_hash.clone().unwrap_or_default(),
        };
        send_to_peer(services, trade, Role::Maker, request, SendMode::Direct).await?;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            amount = %crate::log_amount!(trade.amount),
            "Trade request sent to maker"
        );
        ctx.effects.start_timeout = true;
        Ok(())
    }
}

// ============================================================================
// Maker
// ============================================================================

pub struct MakerProcessInitTradeRequest;

#[async_trait]
impl Task for MakerProcessInitTradeRequest {
    fn name(&self) -> &'static str {
        "MakerProcessInitTradeRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &InitTradeRequest = ctx.message()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        validate_terms(trade, request)?;
        if trade.peer(Role::Taker).pub_key_ring.as_ref() != Some(&request.taker_pub_key_ring) {
            return Err(ProtocolError::Verification(
                "declared taker key ring differs from the sender's".to_string(),
            ));
        }

        let taker = trade.peer_mut(Role::Taker);
        taker.node_address = Some(request.taker_node_address.clone());
        taker.account_id = Some(request.payment_account_id.clone());
        taker.payment_account_payload_hash = Some(request.payment_account_payload_hash.clone());
        set_own_account(trade, services)
    }
}

pub struct MakerSendInitTradeRequest;

#[async_trait]
impl Task for MakerSendInitTradeRequest {
    fn name(&self) -> &'static str {
        "MakerSendInitTradeRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &InitTradeRequest = ctx.message()?;
        let services = ctx.services;
        let trade = &*ctx.trade;
        let own = trade.self_peer();
        let forwarded = InitTradeRequest {
            header: MessageHeader::new(&trade.id, &services.node_address),
            payment_account_id: own.account_id.clone().unwrap_or_default(),
            payment_account_payload_hash: own.payment_account_payload_hash.clone().unwrap_or_default(),
            ..request.clone()
        };
        send_to_peer(services, trade, Role::Arbitrator, forwarded, SendMode::Direct).await?;
        ctx.effects.start_timeout = true;
        Ok(())
    }
}

// ============================================================================
// Arbitrator
// ============================================================================

pub struct ArbitratorProcessInitTradeRequest;

#[async_trait]
impl Task for ArbitratorProcessInitTradeRequest {
    fn name(&self) -> &'static str {
        "ArbitratorProcessInitTradeRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &InitTradeRequest = ctx.message()?;
        let trade = &mut *ctx.trade;
        validate_terms(trade, request)?;

        let maker = trade.peer_mut(Role::Maker);
        maker.account_id = Some(request.payment_account_id.clone());
        maker.payment_account_payload_hash = Some(request.payment_account_payload_hash.clone());

        let taker = trade.peer_mut(Role::Taker);
        taker.node_address = Some(request.taker_node_address.clone());
        taker.pub_key_ring = Some(request.taker_pub_key_ring.clone());
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            taker = %request.taker_pub_key_ring.short_id(),
            "Arbitrating new trade"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use escrow_types::{KeyRing, NodeAddress, OfferDirection};

    fn request_for(trade: &Trade) -> InitTradeRequest {
        let taker = KeyRing::generate();
        InitTradeRequest {
            header: MessageHeader::new(&trade.id, &NodeAddress::new("taker:1")),
            offer: trade.offer.clone(),
            trade_amount: trade.amount,
            price: trade.offer.price,
            maker_node_address: trade.offer.maker_node_address.clone(),
            maker_pub_key_ring: trade.offer.maker_pub_key_ring.clone(),
            taker_node_address: NodeAddress::new("taker:1"),
            taker_pub_key_ring: taker.pub_key_ring(),
            taker_fee: config::taker_fee(trade.amount),
            payment_account_id: "acct".into(),
            payment_account_payload_hash: "hash".into(),
        }
    }

    #[test]
    fn test_terms_accepted_when_consistent() {
        let trade = sample_trade(OfferDirection::Buy, Role::Maker);
        assert!(validate_terms(&trade, &request_for(&trade)).is_ok());
    }

    #[test]
    fn test_terms_rejected_on_price_or_fee() {
        let trade = sample_trade(OfferDirection::Buy, Role::Maker);
        let mut request = request_for(&trade);
        request.price += 1;
        assert!(matches!(
            validate_terms(&trade, &request),
            Err(ProtocolError::Verification(_))
        ));

        let mut request = request_for(&trade);
        request.taker_fee = 0;
        assert!(validate_terms(&trade, &request).is_err());
    }
}
