//! Per-party working data of a trade

use escrow_types::{EncryptedPayload, NodeAddress, PaymentAccountPayload, PubKeyRing};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Multisig blob stages, in setup order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultisigStage {
    Prepared,
    Made,
    Exchanged,
}

impl MultisigStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultisigStage::Prepared => "prepared",
            MultisigStage::Made => "made",
            MultisigStage::Exchanged => "exchanged",
        }
    }
}

/// One party of a trade as seen by this node, including this node itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingPeer {
    /// Updated when the peer reconnects from a new address
    pub node_address: Option<NodeAddress>,
    pub pub_key_ring: Option<PubKeyRing>,

    pub account_id: Option<String>,
    pub payment_account_payload_hash: Option<String>,
    pub encrypted_payment_account_payload: Option<EncryptedPayload>,
    pub payment_account_key: Option<String>,
    /// Own payload, or the peer's once its key is revealed
    pub payment_account_payload: Option<PaymentAccountPayload>,

    pub contract_signature: Option<String>,
    pub payout_address: Option<String>,

    pub deposit_tx_hash: Option<String>,
    pub deposit_tx_hex: Option<String>,
    pub deposit_tx_key: Option<String>,
    /// Multisig address the peer declared in its deposit request
    pub declared_multisig_address: Option<String>,

    pub prepared_multisig_hex: Option<String>,
    pub made_multisig_hex: Option<String>,
    pub exchanged_multisig_hex: Option<String>,
    pub updated_multisig_hex: Option<String>,

    /// Partially signed mediated payout received from this peer
    pub mediated_payout_tx_hex: Option<String>,

    /// Message class -> whether the last ACK from this peer was positive
    #[serde(default)]
    pub ack_status: BTreeMap<String, bool>,
}

impl TradingPeer {
    pub fn with_identity(node_address: NodeAddress, pub_key_ring: PubKeyRing) -> Self {
        Self {
            node_address: Some(node_address),
            pub_key_ring: Some(pub_key_ring),
            ..Default::default()
        }
    }

    pub fn multisig_hex(&self, stage: MultisigStage) -> Option<&String> {
        match stage {
            MultisigStage::Prepared => self.prepared_multisig_hex.as_ref(),
            MultisigStage::Made => self.made_multisig_hex.as_ref(),
            MultisigStage::Exchanged => self.exchanged_multisig_hex.as_ref(),
        }
    }

    /// Record a multisig blob. A blob differing from the recorded one is an error;
    /// returns whether anything new was recorded.
    pub fn record_multisig_hex(
        &mut self,
        stage: MultisigStage,
        hex: &str,
    ) -> Result<bool, MultisigStage> {
        let slot = match stage {
            MultisigStage::Prepared => &mut self.prepared_multisig_hex,
            MultisigStage::Made => &mut self.made_multisig_hex,
            MultisigStage::Exchanged => &mut self.exchanged_multisig_hex,
        };
        match slot {
            Some(existing) if existing == hex => Ok(false),
            Some(_) => Err(stage),
            None => {
                *slot = Some(hex.to_string());
                Ok(true)
            }
        }
    }

    pub fn is_acked(&self, message_class: &str) -> bool {
        self.ack_status.get(message_class).copied().unwrap_or(false)
    }
}
