//! Protocol tasks and the pipelines built from them
//!
//! Pipelines are assembled fresh for every message or local action; tasks
//! carry no state between runs.

pub mod contract;
pub mod deposit;
pub mod init;
pub mod multisig;
pub mod payment;

use super::messages::Message;
use super::pipeline::Pipeline;
use crate::error::{ProtocolError, ProtocolResult};
use crate::models::Role;

/// The two parties other than `role`
pub(crate) fn others(role: Role) -> [Role; 2] {
    match role {
        Role::Maker => [Role::Taker, Role::Arbitrator],
        Role::Taker => [Role::Maker, Role::Arbitrator],
        Role::Arbitrator => [Role::Maker, Role::Taker],
    }
}

/// The counterparty trader of a trader role
pub(crate) fn counterparty(role: Role) -> Role {
    match role {
        Role::Maker => Role::Taker,
        _ => Role::Maker,
    }
}

pub(crate) fn required<T: Clone>(value: &Option<T>, what: impl FnOnce() -> String) -> ProtocolResult<T> {
    value.clone().ok_or_else(|| ProtocolError::MissingData(what()))
}

/// Fail unless the identified sender is `expected`
pub(crate) fn expect_sender(actual: Role, expected: Role, what: &str) -> ProtocolResult<()> {
    if actual != expected {
        return Err(ProtocolError::InvalidMessage(format!(
            "{what} must come from the {expected}, got it from the {actual}"
        )));
    }
    Ok(())
}

/// Pipeline applying `message` for a node in `role`, if that role handles it
pub fn message_pipeline(role: Role, is_buyer: bool, message: &Message) -> Option<Pipeline> {
    let is_trader = role.is_trader();
    match message {
        Message::InitTradeRequest(_) => match role {
            Role::Maker => Some(init::maker_init_pipeline()),
            Role::Arbitrator => Some(init::arbitrator_init_pipeline()),
            Role::Taker => None,
        },
        Message::InitMultisigRequest(_) => Some(multisig::init_multisig_pipeline(role)),
        Message::SignContractRequest(_) => Some(contract::sign_contract_request_pipeline(role)),
        Message::SignContractResponse(_) => Some(contract::sign_contract_response_pipeline(role)),
        Message::DepositRequest(_) if !is_trader => Some(deposit::deposit_request_pipeline()),
        Message::DepositResponse(_) if is_trader => Some(deposit::deposit_response_pipeline()),
        Message::DepositsConfirmed(_) => Some(deposit::deposits_confirmed_pipeline(role)),
        Message::PaymentSent(_) if !is_trader => Some(payment::arbitrator_payment_sent_pipeline()),
        Message::PaymentSent(_) if !is_buyer => Some(payment::seller_payment_sent_pipeline(role)),
        Message::PaymentReceived(_) if !is_trader => {
            Some(payment::arbitrator_payment_received_pipeline())
        }
        Message::PaymentReceived(_) if is_buyer => {
            Some(payment::buyer_payment_received_pipeline(role))
        }
        _ => None,
    }
}
