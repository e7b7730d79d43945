//! Per-trade working memory

use escrow_types::NodeAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::role::Role;
use super::trading_peer::TradingPeer;
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::messages::{PaymentReceivedMessage, PaymentSentMessage};

/// Payout split proposed by a mediator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatedPayout {
    pub buyer_amount: u64,
    pub seller_amount: u64,
}

/// Message being applied by the running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingMessage {
    pub uid: String,
    pub sender: NodeAddress,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessModel {
    pub maker: TradingPeer,
    pub taker: TradingPeer,
    pub arbitrator: TradingPeer,

    multisig_address: Option<String>,
    pub temp_peer_node_address: Option<NodeAddress>,
    pub mediated_payout: Option<MediatedPayout>,

    pub payment_sent_message_acked: bool,
    pub payment_received_message_acked: bool,
    pub deposits_confirmed_message_sent: bool,

    /// Kept for resending until acknowledged
    pub payment_sent_message: Option<PaymentSentMessage>,
    pub payment_received_message: Option<PaymentReceivedMessage>,

    /// Uids of messages applied successfully
    #[serde(default)]
    processed_uids: BTreeSet<String>,

    #[serde(skip)]
    pub current_message: Option<ProcessingMessage>,
}

impl ProcessModel {
    pub fn peer(&self, role: Role) -> &TradingPeer {
        match role {
            Role::Maker => &self.maker,
            Role::Taker => &self.taker,
            Role::Arbitrator => &self.arbitrator,
        }
    }

    pub fn peer_mut(&mut self, role: Role) -> &mut TradingPeer {
        match role {
            Role::Maker => &mut self.maker,
            Role::Taker => &mut self.taker,
            Role::Arbitrator => &mut self.arbitrator,
        }
    }

    pub fn multisig_address(&self) -> Option<&str> {
        self.multisig_address.as_deref()
    }

    /// Set the multisig address once. Repeating the same address is a no-op;
    /// a different one is an error.
    pub fn set_multisig_address(&mut self, address: &str) -> ProtocolResult<bool> {
        match &self.multisig_address {
            Some(existing) if existing == address => Ok(false),
            Some(existing) => Err(ProtocolError::Internal(format!(
                "multisig address already set to {existing}, refusing {address}"
            ))),
            None => {
                self.multisig_address = Some(address.to_string());
                Ok(true)
            }
        }
    }

    pub fn is_processed(&self, uid: &str) -> bool {
        self.processed_uids.contains(uid)
    }

    pub fn mark_processed(&mut self, uid: &str) {
        self.processed_uids.insert(uid.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multisig_address_set_once() {
        let mut model = ProcessModel::default();
        assert!(model.set_multisig_address("4abc").unwrap());
        assert!(!model.set_multisig_address("4abc").unwrap());
        assert!(model.set_multisig_address("4def").is_err());
        assert_eq!(model.multisig_address(), Some("4abc"));
    }

    #[test]
    fn test_processed_uids() {
        let mut model = ProcessModel::default();
        assert!(!model.is_processed("u1"));
        model.mark_processed("u1");
        assert!(model.is_processed("u1"));
    }

    #[test]
    fn test_peer_lookup() {
        let mut model = ProcessModel::default();
        model.peer_mut(Role::Taker).account_id = Some("acct".into());
        assert_eq!(model.taker.account_id.as_deref(), Some("acct"));
        assert!(model.peer(Role::Maker).account_id.is_none());
    }
}
