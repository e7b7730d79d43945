//! Contract signing
//!
//! After the multisig completes each trader funds its deposit (unpublished)
//! and announces its terms. Once both traders' terms are known all three
//! parties build the same contract; the traders sign it and exchange
//! signatures, then hand their deposit to the arbitrator.

use async_trait::async_trait;
use escrow_types::{seal_payment_account_payload, sign_contract, verify_contract_signature, Contract};
use tracing::info;

use super::{counterparty, others, required};
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::{Phase, Role, State, Trade};
use crate::p2p::MailboxOutcome;
use crate::protocol::condition::Condition;
use crate::protocol::messages::{
    DepositRequest, MessageHeader, SignContractRequest, SignContractResponse,
};
use crate::protocol::outbox::{send_to_peer, SendMode};
use crate::protocol::pipeline::{tasks, Pipeline, Task, TaskContext};

pub fn sign_contract_request_pipeline(role: Role) -> Pipeline {
    let (senders, wait_for): (&[Role], State) = match role {
        Role::Arbitrator => (&[Role::Maker, Role::Taker], State::MultisigCompleted),
        Role::Maker => (&[Role::Taker], State::ContractSignatureRequested),
        Role::Taker => (&[Role::Maker], State::ContractSignatureRequested),
    };
    Pipeline::new(
        "SignContractRequest",
        Condition::new()
            .phase(&[Phase::Init])
            .from(senders)
            .ignore_when(|trade| trade.state() >= State::ContractSigned),
        tasks![ProcessSignContractRequest, MaybeSignContract],
    )
    .wait_for(wait_for)
}

pub fn sign_contract_response_pipeline(role: Role) -> Pipeline {
    let senders: &[Role] = match role {
        Role::Arbitrator => &[Role::Maker, Role::Taker],
        Role::Maker => &[Role::Taker],
        Role::Taker => &[Role::Maker],
    };
    Pipeline::new(
        "SignContractResponse",
        Condition::new().phase(&[Phase::Init]).from(senders),
        tasks![ProcessSignContractResponse, SendDepositRequest],
    )
    .wait_for(State::ContractSigned)
}

/// Build the contract from the trade. Every party holds the same inputs by the
/// time this runs, so the JSON is byte-identical everywhere.
pub fn build_contract(trade: &Trade) -> ProtocolResult<Contract> {
    let maker = trade.peer(Role::Maker);
    let taker = trade.peer(Role::Taker);
    Ok(Contract {
        offer_id: trade.offer.id.clone(),
        direction: trade.offer.direction,
        currency_code: trade.offer.currency_code.clone(),
        price: trade.price,
        trade_amount: trade.amount,
        maker_fee: trade.maker_fee,
        taker_fee: trade.taker_fee,
        buyer_security_deposit: trade.buyer_security_deposit,
        seller_security_deposit: trade.seller_security_deposit,
        maker_node_address: required(&maker.node_address, || "maker node address".into())?,
        taker_node_address: required(&taker.node_address, || "taker node address".into())?,
        arbitrator_node_address: trade.offer.arbitrator_node_address.clone(),
        maker_pub_key_ring: required(&maker.pub_key_ring, || "maker key ring".into())?,
        taker_pub_key_ring: required(&taker.pub_key_ring, || "taker key ring".into())?,
        arbitrator_pub_key_ring: trade.offer.arbitrator_pub_key_ring.clone(),
        maker_account_id: required(&maker.account_id, || "maker account id".into())?,
        taker_account_id: required(&taker.account_id, || "taker account id".into())?,
        maker_payment_account_payload_hash: required(&maker.payment_account_payload_hash, || {
            "maker payment account hash".into()
        })?,
        taker_payment_account_payload_hash: required(&taker.payment_account_payload_hash, || {
            "taker payment account hash".into()
        })?,
        maker_payout_address: required(&maker.payout_address, || "maker payout address".into())?,
        taker_payout_address: required(&taker.payout_address, || "taker payout address".into())?,
        maker_deposit_tx_hash: required(&maker.deposit_tx_hash, || "maker deposit".into())?,
        taker_deposit_tx_hash: required(&taker.deposit_tx_hash, || "taker deposit".into())?,
        multisig_address: trade.multisig_address()?.to_string(),
    })
}

fn contract_inputs_ready(trade: &Trade) -> bool {
    [Role::Maker, Role::Taker].into_iter().all(|role| {
        let peer = trade.peer(role);
        peer.account_id.is_some()
            && peer.payment_account_payload_hash.is_some()
            && peer.payout_address.is_some()
            && peer.deposit_tx_hash.is_some()
    })
}

// ============================================================================
// Tasks
// ============================================================================

/// Trader: fund the deposit and announce terms once the multisig is complete
pub struct MaybeSendSignContractRequest;

#[async_trait]
impl Task for MaybeSendSignContractRequest {
    fn name(&self) -> &'static str {
        "MaybeSendSignContractRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if !trade.role.is_trader()
            || trade.state() != State::MultisigCompleted
            || trade.self_peer().deposit_tx_hash.is_some()
        {
            return Ok(());
        }

        let side = trade
            .side()
            .ok_or_else(|| ProtocolError::Internal("trader without a side".to_string()))?;
        let deposit_amount = trade.rules().deposit_send_amount(trade) + trade.security_deposit_of(side);
        let trade_fee = trade.trade_fee_of(trade.role);
        let multisig_address = trade.multisig_address()?.to_string();
        let deposit = services
            .wallet
            .create_deposit_tx(
                &trade.id,
                &multisig_address,
                &services.fee_address,
                trade_fee,
                deposit_amount,
            )
            .await?;
        let (encrypted, key) = seal_payment_account_payload(&services.payment_account)?;
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            txid = %crate::log_txid!(&deposit.hash),
            amount = %crate::log_amount!(deposit_amount),
            "Deposit created"
        );

        let own = trade.self_peer_mut();
        own.deposit_tx_hash = Some(deposit.hash.clone());
        own.deposit_tx_hex = Some(deposit.hex);
        own.deposit_tx_key = Some(deposit.key);
        own.encrypted_payment_account_payload = Some(encrypted);
        own.payment_account_key = Some(key);

        let own = trade.self_peer();
        let request = SignContractRequest {
            header: MessageHeader::new(&trade.id, &services.node_address),
            account_id: required(&own.account_id, || "own account id".into())?,
            payment_account_payload_hash: required(&own.payment_account_payload_hash, || {
                "own payment account hash".into()
            })?,
            payout_address: required(&own.payout_address, || "own payout address".into())?,
            deposit_tx_hash: deposit.hash,
        };
        for role in others(trade.role) {
            send_to_peer(services, trade, role, request.clone(), SendMode::Mailbox).await?;
        }
        trade.advance_state(State::ContractSignatureRequested)?;
        Ok(())
    }
}

pub struct ProcessSignContractRequest;

#[async_trait]
impl Task for ProcessSignContractRequest {
    fn name(&self) -> &'static str {
        "ProcessSignContractRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let request: &SignContractRequest = ctx.message()?;
        let sender = ctx.sender()?;
        let peer = ctx.trade.peer_mut(sender);
        peer.account_id = Some(request.account_id.clone());
        peer.payment_account_payload_hash = Some(request.payment_account_payload_hash.clone());
        peer.payout_address = Some(request.payout_address.clone());
        peer.deposit_tx_hash = Some(request.deposit_tx_hash.clone());
        Ok(())
    }
}

/// Build the contract once both traders' terms are known; traders also sign it
pub struct MaybeSignContract;

#[async_trait]
impl Task for MaybeSignContract {
    fn name(&self) -> &'static str {
        "MaybeSignContract"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if trade.contract.is_some() || !contract_inputs_ready(trade) {
            return Ok(());
        }

        let contract = build_contract(trade)?;
        let json = contract.to_json()?;
        let hash = Contract::hash_json(&json);
        info!(
            trade_id = %crate::log_trade_id!(&trade.id),
            role = %trade.role,
            contract_hash = %&hash[..16],
            "Contract built"
        );
        trade.contract = Some(contract);
        trade.contract_json = Some(json.clone());
        trade.contract_hash = Some(hash);

        if trade.role.is_trader() {
            let signature = sign_contract(&services.key_ring, &json);
            trade.self_peer_mut().contract_signature = Some(signature.clone());
            let response = SignContractResponse {
                header: MessageHeader::new(&trade.id, &services.node_address),
                contract_json: json,
                contract_signature: signature,
                encrypted_payment_account_payload: required(
                    &trade.self_peer().encrypted_payment_account_payload,
                    || "own encrypted payment account".into(),
                )?,
            };
            for role in others(trade.role) {
                send_to_peer(services, trade, role, response.clone(), SendMode::Mailbox).await?;
            }
        }
        trade.advance_state(State::ContractSigned)?;
        Ok(())
    }
}

pub struct ProcessSignContractResponse;

#[async_trait]
impl Task for ProcessSignContractResponse {
    fn name(&self) -> &'static str {
        "ProcessSignContractResponse"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let response: &SignContractResponse = ctx.message()?;
        let sender = ctx.sender()?;
        let trade = &mut *ctx.trade;

        let ours = trade.contract_json()?;
        if response.contract_json != ours {
            return Err(ProtocolError::ContractMismatch(format!(
                "contract from {sender} hashes to {}, ours to {}",
                Contract::hash_json(&response.contract_json),
                Contract::hash_json(ours)
            )));
        }
        let key = required(&trade.peer(sender).pub_key_ring, || format!("{sender} key ring"))?;
        verify_contract_signature(&key, ours, &response.contract_signature).map_err(|e| {
            ProtocolError::SignatureMismatch(format!("contract signature of {sender}: {e}"))
        })?;

        let peer = trade.peer_mut(sender);
        peer.contract_signature = Some(response.contract_signature.clone());
        peer.encrypted_payment_account_payload = Some(response.encrypted_payment_account_payload.clone());
        Ok(())
    }
}

/// Trader: hand the deposit to the arbitrator once the peer's signature is in
pub struct SendDepositRequest;

#[async_trait]
impl Task for SendDepositRequest {
    fn name(&self) -> &'static str {
        "SendDepositRequest"
    }

    async fn run(&self, ctx: &mut TaskContext<'_>) -> ProtocolResult<()> {
        let services = ctx.services;
        let trade = &mut *ctx.trade;
        if !trade.role.is_trader()
            || trade.state() != State::ContractSigned
            || trade.peer(counterparty(trade.role)).contract_signature.is_none()
        {
            return Ok(());
        }

        let own = trade.self_peer();
        let request = DepositRequest {
            header: MessageHeader::new(&trade.id, &services.node_address),
            deposit_tx_hex: required(&own.deposit_tx_hex, || "own deposit hex".into())?,
            deposit_tx_key: required(&own.deposit_tx_key, || "own deposit key".into())?,
            contract_signature: required(&own.contract_signature, || "own contract signature".into())?,
            multisig_address: trade.multisig_address()?.to_string(),
            payment_account_key: required(&own.payment_account_key, || "own payment account key".into())?,
        };
        trade.advance_state(State::SentPublishDepositTxRequest)?;
        match send_to_peer(services, trade, Role::Arbitrator, request, SendMode::Mailbox).await {
            Ok(MailboxOutcome::Arrived) => {
                trade.set_state(State::SawArrivedPublishDepositTxRequest);
            }
            Ok(MailboxOutcome::StoredInMailbox) => {}
            Err(e) => {
                trade.set_state(State::SendFailedPublishDepositTxRequest);
                return Err(e);
            }
        }
        ctx.effects.start_timeout = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::tests::sample_trade;
    use escrow_types::{KeyRing, NodeAddress, OfferDirection};

    fn fill_terms(trade: &mut Trade) {
        let taker = KeyRing::generate();
        trade.process_model.set_multisig_address("4multisig").unwrap();
        for role in [Role::Maker, Role::Taker] {
            let peer = trade.peer_mut(role);
            if peer.pub_key_ring.is_none() {
                peer.pub_key_ring = Some(taker.pub_key_ring());
                peer.node_address = Some(NodeAddress::new("taker.onion:9999"));
            }
            peer.account_id = Some(format!("{role}-acct"));
            peer.payment_account_payload_hash = Some(format!("{role}-hash"));
            peer.payout_address = Some(format!("{role}-payout"));
            peer.deposit_tx_hash = Some(format!("{role}-deposit"));
        }
    }

    #[test]
    fn test_contract_requires_both_traders() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Arbitrator);
        assert!(!contract_inputs_ready(&trade));
        assert!(matches!(build_contract(&trade), Err(ProtocolError::MissingData(_))));
        fill_terms(&mut trade);
        assert!(contract_inputs_ready(&trade));
    }

    #[test]
    fn test_contract_follows_offer_direction() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Arbitrator);
        fill_terms(&mut trade);
        let contract = build_contract(&trade).unwrap();
        assert_eq!(contract.buyer_payout_address(), "maker-payout");
        assert_eq!(contract.seller_payout_address(), "taker-payout");
        assert_eq!(contract.total_escrowed(), trade.total_escrowed());
        assert_eq!(contract.multisig_address, "4multisig");

        // Same inputs, same JSON
        let again = build_contract(&trade).unwrap();
        assert_eq!(contract.to_json().unwrap(), again.to_json().unwrap());
    }
}
