//! Simulated transaction encoding

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::{WalletError, WalletResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Deposit,
    Payout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedTx {
    pub kind: TxKind,
    /// Funding address: a trader's primary address or the multisig address
    pub source: String,
    pub outputs: Vec<TxOutput>,
    pub miner_fee: u64,
    pub nonce: String,
    pub required_signatures: u32,
    pub signers: BTreeSet<String>,
}

impl SimulatedTx {
    /// Hash over everything except signatures, so co-signing keeps the id stable
    pub fn hash(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.signers.clear();
        let bytes = serde_json::to_vec(&unsigned).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn to_hex(&self) -> WalletResult<String> {
        serde_json::to_vec(self)
            .map(hex::encode)
            .map_err(|e| WalletError::InvalidTxHex(e.to_string()))
    }

    pub fn from_hex(tx_hex: &str) -> WalletResult<Self> {
        let bytes = hex::decode(tx_hex).map_err(|e| WalletError::InvalidTxHex(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| WalletError::InvalidTxHex(e.to_string()))
    }

    /// Proof-of-payment key derived from the nonce
    pub fn tx_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"tx-key");
        hasher.update(self.nonce.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn output_to(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.address == address)
            .map(|o| o.amount)
            .sum()
    }

    /// Outputs plus miner fee
    pub fn total_spent(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum::<u64>() + self.miner_fee
    }

    pub fn is_fully_signed(&self) -> bool {
        self.signers.len() >= self.required_signatures as usize
    }
}
