//! Deposit verification, publication and confirmation
//!
//! The arbitrator checks each trader's deposit against terms it computes
//! itself. Only when both deposits pass are they submitted without relay and
//! then relayed as a pair; any failure flushes what was submitted.

use async_trait::async_trait;
use escrow_types::open_and_verify_payload;
use escrow_wallet::{TradeTxExpectation, VerifiedTradeTx};
use tracing::{error, info, warn};

use super::others;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{side_of, rules_for, Phase, Role, State, Trade};
use crate::protocol::condition::Condition;
use crate::protocol::messages::{
    DepositRequest, DepositResponse, DepositsConfirmedMessage, MessageHeader,
};
use crate::protocol::outbox::{send_to_peer, SendMode};
use crate::protocol::pipeline::{tasks, Pipeline, Task, TaskContext};
use crate::protocol::ProtocolServices;

pub fn deposit_request_pipeline() -> Pipeline {
    Pipeline::new(
        "DepositRequest",
        Condition::new()
            .phase(&[Phase::Init])
            .from(&[Role::Maker, Role::Taker])
            .ignore_when(|trade| trade.phase() > Phase::Init),
        tasks![ArbitratorProcessDepositRequest, ArbitratorPublishDepositTxs],
    )
    .wait_for(State::ContractSigned)
}

pub fn deposit_response_pipeline() -> Pipeline {
    Pipeline::new(
        "DepositResponse",
        Condition::new()
            .from(&[Role::Arbitrator])
            .ignore_when(|trade| trade.state() >= State::ArbitratorPublishedDepositTxs),
        tasks![ProcessDepositResponse],
    )
}

pub fn deposits_confirmed_pipeline(role: Role) -> Pipeline {
    Pipeline::new(
        "DepositsConfirmed",
        Condition::new().from(&others(role)),
        tasks![ProcessDepositsConfirmed],
    )
    .wait_for(State::ContractSigned)
}

/// Check a trader's deposit request against the contract and our own terms
async fn verify_deposit(
    trade: &Trade,
    services: &ProtocolServices,
    sender: Role,
    request: &DepositRequest,
) -> ProtocolResult<VerifiedTradeTx> {
    let contract_json = trade.contract_json()?;
    let sender_key = trade
        .peer(sender)
        .pub_key_ring
        .clone()
        .ok_or_else(|| ProtocolError::MissingData(format!("{sender} key ring")))?;
    sender_key
        .verify(contract_json.as_bytes(), &request.contract_signature)
        .map_err(|e| ProtocolError::SignatureMismatch(format!("contract signature: {e}")))?;

    let ours = trade.multisig_address()?;
    if request.multisig_address != ours {
        return Err(ProtocolError::MultisigAddressMismatch {
            role: sender,
            ours: ours.to_string(),
            declared: request.multisig_address.clone(),
        });
    }

    let side = side_of(sender, trade.offer.is_buy_offer())
        .ok_or_else(|| ProtocolError::Internal(format!("{sender} has no side")))?;
    let expectation = TradeTxExpectation {
        trade_fee: trade.trade_fee_of(sender),
        fee_address: services.fee_address.clone(),
        send_amount: rules_for(sender, Some(side)).deposit_send_amount(trade),
        security_deposit: trade.security_deposit_of(side),
        multisig_address: ours.to_string(),
        tx_hash: trade.peer(sender).deposit_tx_hash.clone(),
    };
    Ok(services
        .wallet
        .verify_trade_tx(&expectation, &request.deposit_tx_hex, &request.deposit_tx_key)
        .await?)
}

/// Tell both traders how deposit publication went. Traders also follow the
/// deposits on chain, so a response that cannot be sent is recorded, not
/// fatal. Returns the traders that were not reached.
async fn send_deposit_responses(
    trade: &mut Trade,
    services: &ProtocolServices,
    error_message: Option<String>,
) -> Vec<Role> {
    let mut unreached = Vec::new();
    for role in [Role::Maker, Role::Taker] {
        let response = DepositResponse {
            header: MessageHeader::new(&trade.id, &services.node_address),
            error_message: error_message.clone(),
        };
        if let Err(e) = send_to_peer(services, trade, role, response, SendMode::Mailbox).await {
            warn!(
                trade_id = %crate::log_trade_id!(&trade.id),
                to = %role,
                error = %e,
                "DepositResponse not sent"
            );
            if error_message.is_none() {
                trade.error_message = Some(format!("DepositResponse to {role} not sent: {e}"));
            }
            unreached.push(role);
        }
    }
    unreached
}

// ============================================================================
// Arbitrator
// ============================================================================

pub struct ArbitratorProcessDepositRequest;

#[async_trait]
impl Task for ArbitratorProcessDepositRequest {
    fn name(&self) -> &'static str {
        "ArbitratorProcessDepositRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &DepositRequest = ctx.message()?;
        let sender = ctx.sender()?;
        let services = ctx.services;
        let trade = &mut *ctx.trade;

        let verified = match verify_deposit(trade, services, sender, request).await {
            Ok(verified) => verified,
            Err(e) => {
                let message = format!("Error processing deposit tx from {sender}: {e}");
                error!(trade_id = %crate::log_trade_id!(&trade.id), "{}", message);
                send_deposit_responses(trade, services, Some(message.clone())).await;
                return Err(ProtocolError::Verification(message));
            }
        };

        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            from = %sender,
            txid = %crate::log_txid!(&verified.hash),
            "Deposit verified"
        );
        let peer = trade.peer_mut(sender);
        peer.deposit_tx_hash = Some(verified.hash);
        peer.deposit_tx_hex = Some(request.deposit_tx_hex.clone());
        peer.deposit_tx_key = Some(request.deposit_tx_key.clone());
        peer.contract_signature = Some(request.contract_signature.clone());
        peer.declared_multisig_address = Some(request.multisig_address.clone());
        peer.payment_account_key = Some(request.payment_account_key.clone());
        Ok(())
    }
}

/// Submit both verified deposits without relay, then relay them together
pub struct ArbitratorPublishDepositTxs;

impl ArbitratorPublishDepositTxs {
    async fn publish(trade: &Trade, services: &ProtocolServices) -> ProtocolResult<()> {
        let deposits: Vec<(String, String)> = [Role::Maker, Role::Taker]
            .into_iter()
            .filter_map(|role| {
                let peer = trade.peer(role);
                Some((peer.deposit_tx_hash.clone()?, peer.deposit_tx_hex.clone()?))
            })
            .collect();
        let hashes: Vec<String> = deposits.iter().map(|(hash, _)| hash.clone()).collect();

        let mut submitted = Vec::new();
        for (hash, hex) in &deposits {
            if services.daemon.get_tx(hash).await?.is_some() {
                // Submitted by an earlier run of this pipeline
                continue;
            }
            match services.daemon.submit_tx_hex(hex, true).await {
                Ok(_) => submitted.push(hash.clone()),
                Err(e) => {
                    flush(services, &submitted).await;
                    return Err(e.into());
                }
            }
        }
        if let Err(e) = services.daemon.relay_txs_by_hash(&hashes).await {
            flush(services, &submitted).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn flush(services: &ProtocolServices, hashes: &[String]) {
    if hashes.is_empty() {
        return;
    }
    warn!(count = hashes.len(), "Flushing unrelayed deposits");
    if let Err(e) = services.daemon.flush_tx_pool(hashes).await {
        error!(error = %e, "Failed to flush unrelayed deposits");
    }
}

#[async_trait]
impl Task for ArbitratorPublishDepositTxs {
    fn name(&self) -> &'static str {
        "ArbitratorPublishDepositTxs"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        let both_verified = [Role::Maker, Role::Taker]
            .into_iter()
            .all(|role| trade.peer(role).deposit_tx_hex.is_some());
        if !both_verified {
            return Ok(());
        }

        if let Err(e) = Self::publish(trade, services).await {
            let message = format!("Error publishing deposit txs: {e}");
            send_deposit_responses(trade, services, Some(message)).await;
            return Err(e);
        }

        trade.advance_state(State::ArbitratorPublishedDepositTxs)?;
        ctx.effects.stop_timeout = true;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            "✅ Deposits published"
        );
        send_deposit_responses(trade, services, None).await;
        Ok(())
    }
}

// ============================================================================
// Traders
// ============================================================================

pub struct ProcessDepositResponse;

#[async_trait]
impl Task for ProcessDepositResponse {
    fn name(&self) -> &'static str {
        "ProcessDepositResponse"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let response: &DepositResponse = ctx.message()?;
        if let Some(reason) = &response.error_message {
            return Err(ProtocolError::PeerRejected {
                message: "DepositRequest".to_string(),
                reason: reason.clone(),
            });
        }
        ctx.trade.advance_state(State::ArbitratorPublishedDepositTxs)?;
        ctx.effects.stop_timeout = true;
        Ok(())
    }
}

/// Open a peer's sealed payment account with its revealed key
pub(crate) fn reveal_payment_account(
    trade: &mut Trade,
    role: Role,
    key: &str,
    expected_hash: &str,
) -> ProtocolResult<()> {
    let peer = trade.peer(role);
    if peer.payment_account_payload.is_some() {
        return Ok(());
    }
    let encrypted = peer
        .encrypted_payment_account_payload
        .as_ref()
        .ok_or_else(|| ProtocolError::MissingData(format!("{role} encrypted payment account")))?;
    let payload = open_and_verify_payload(encrypted, key, expected_hash)?;
    let peer = trade.peer_mut(role);
    peer.payment_account_payload = Some(payload);
    peer.payment_account_key = Some(key.to_string());
    Ok(())
}

pub struct ProcessDepositsConfirmed;

#[async_trait]
impl Task for ProcessDepositsConfirmed {
    fn name(&self) -> &'static str {
        "ProcessDepositsConfirmed"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let message: &DepositsConfirmedMessage = ctx.message()?;
        let sender = ctx.sender()?;
        let trade = &mut *ctx.trade;
        trade.peer_mut(sender).updated_multisig_hex = Some(message.updated_multisig_hex.clone());

        if let (true, Some(key)) = (trade.is_buyer(), &message.seller_payment_account_key) {
            let seller = trade.seller_role();
            let expected = trade.contract()?.seller_payment_account_payload_hash().to_string();
            reveal_payment_account(trade, seller, key, &expected)?;
            info!(
                trade_id = %crate::log_trade_id!(&trade.id),
                from = %sender,
                "Seller payment account revealed"
            );
        }
        Ok(())
    }
}

/// Export updated multisig info and send it to both other parties. The buyer
/// also learns the seller's payment account key.
pub async fn send_deposits_confirmed(trade: &mut Trade, services: &ProtocolServices) -> ProtocolResult<()> {
    let updated = services.wallet.export_multisig_hex(&trade.id).await?;
    trade.self_peer_mut().updated_multisig_hex = Some(updated.clone());

    let seller_key = if trade.is_arbitrator() {
        trade.peer(trade.seller_role()).payment_account_key.clone()
    } else if trade.is_seller() {
        trade.self_peer().payment_account_key.clone()
    } else {
        None
    };
    let buyer = trade.buyer_role();

    let mut first_error = None;
    for role in others(trade.role) {
        let message = DepositsConfirmedMessage {
            header: MessageHeader::new(&trade.id, &services.node_address),
            updated_multisig_hex: updated.clone(),
            seller_payment_account_key: if role == buyer { seller_key.clone() } else { None },
        };
        if let Err(e) = send_to_peer(services, trade, role, message, SendMode::Mailbox).await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            info!(
                trade_id = %crate::log_trade_id!(&trade.id),
                role = %trade.role,
                "Deposits confirmed message sent"
            );
            Ok(())
        }
    }
}
