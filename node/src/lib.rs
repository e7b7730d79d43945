//! Escrow trade protocol engine
//!
//! Drives a trade between a maker, a taker and an arbitrator from offer-taking
//! through multisig construction, contract signing, deposits, payment
//! confirmation and payout, with mediation and refund tracks alongside.

// Sanitized log helpers, exported before the modules that use them
#[macro_export]
macro_rules! log_trade_id {
    ($id:expr) => {
        $crate::logging::sanitize::sanitize_trade_id($id)
    };
}

#[macro_export]
macro_rules! log_txid {
    ($txid:expr) => {
        $crate::logging::sanitize::sanitize_txid($txid)
    };
}

#[macro_export]
macro_rules! log_address {
    ($addr:expr) => {
        $crate::logging::sanitize::sanitize_address($addr)
    };
}

#[macro_export]
macro_rules! log_amount {
    ($amount:expr) => {
        $crate::logging::sanitize::sanitize_amount($amount)
    };
}

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod node;
pub mod p2p;
pub mod persistence;
pub mod protocol;
pub mod services;
pub mod support;
pub mod telemetry;

pub use config::ProtocolConfig;
pub use error::{DeliveryError, PersistenceError, ProtocolError, ProtocolResult, SupportError};
pub use models::{
    Dispute, DisputeResult, DisputeState, MediationResultState, PayoutState, Phase, Role, Side,
    State, Trade,
};
pub use node::{EscrowNode, NodeParams};
pub use services::trade_manager::{TradeEvent, TradeListStatus, TradeManager};
