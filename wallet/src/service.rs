//! Trade wallet contract
//!
//! One multisig wallet exists per trade id. Multisig setup is opaque to the
//! caller: each step returns a blob that must reach the two other parties
//! before anyone can advance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WalletResult;
use crate::fee::fee_share;

/// Signatures required to spend from a trade's multisig wallet
pub const MULTISIG_THRESHOLD: u32 = 2;

/// Result of a key exchange round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigInitResult {
    pub multisig_hex: String,
    /// Present once the final round yields the shared address
    pub address: Option<String>,
}

/// Deposit funding the multisig, created by one trader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTx {
    pub hash: String,
    pub hex: String,
    pub key: String,
    pub miner_fee: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutDestination {
    pub address: String,
    pub amount: u64,
}

impl PayoutDestination {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// Payout spending the multisig, as decoded from its hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTx {
    pub hash: String,
    pub hex: String,
    pub miner_fee: u64,
    /// Net outputs (after each destination's fee share)
    pub outputs: Vec<PayoutDestination>,
    pub signature_count: usize,
}

impl PayoutTx {
    pub fn is_fully_signed(&self) -> bool {
        self.signature_count >= MULTISIG_THRESHOLD as usize
    }

    /// Check the outputs against gross destinations, allowing each output its
    /// share of the miner fee. Zero-amount destinations are not expected on-chain.
    pub fn matches_destinations(&self, destinations: &[PayoutDestination]) -> bool {
        let expected: Vec<&PayoutDestination> =
            destinations.iter().filter(|d| d.amount > 0).collect();
        if expected.len() != self.outputs.len() {
            return false;
        }
        expected.iter().enumerate().all(|(i, dest)| {
            let share = fee_share(self.miner_fee, expected.len(), i);
            let output = &self.outputs[i];
            output.address == dest.address && output.amount + share == dest.amount
        })
    }
}

/// Terms a deposit must satisfy, computed by the verifier from the offer and the
/// depositor's role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTxExpectation {
    pub trade_fee: u64,
    pub fee_address: String,
    pub send_amount: u64,
    pub security_deposit: u64,
    pub multisig_address: String,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedTradeTx {
    pub hash: String,
    pub miner_fee: u64,
}

#[async_trait]
pub trait TradeWallet: Send + Sync {
    /// Main wallet address receiving this node's payouts
    fn primary_address(&self) -> String;

    /// Password protecting this node's multisig wallets
    fn wallet_password(&self) -> String;

    async fn balance(&self) -> WalletResult<u64>;

    async fn create_multisig_wallet(&self, trade_id: &str) -> WalletResult<()>;

    async fn prepare_multisig(&self, trade_id: &str) -> WalletResult<String>;

    async fn make_multisig(
        &self,
        trade_id: &str,
        other_hexes: &[String],
        threshold: u32,
        password: &str,
    ) -> WalletResult<String>;

    /// First call consumes made hexes, second consumes exchanged hexes and yields the address
    async fn exchange_multisig_keys(
        &self,
        trade_id: &str,
        other_hexes: &[String],
        password: &str,
    ) -> WalletResult<MultisigInitResult>;

    async fn create_deposit_tx(
        &self,
        trade_id: &str,
        multisig_address: &str,
        fee_address: &str,
        trade_fee: u64,
        deposit_amount: u64,
    ) -> WalletResult<DepositTx>;

    /// Errors with [`crate::WalletError::TradeTxVerification`] on any mismatch
    async fn verify_trade_tx(
        &self,
        expectation: &TradeTxExpectation,
        tx_hex: &str,
        tx_key: &str,
    ) -> WalletResult<VerifiedTradeTx>;

    async fn export_multisig_hex(&self, trade_id: &str) -> WalletResult<String>;

    async fn import_multisig_hex(&self, trade_id: &str, hexes: &[String]) -> WalletResult<usize>;

    /// Build a payout from the trade's multisig and sign it with this node's share
    async fn create_payout_tx(
        &self,
        trade_id: &str,
        destinations: &[PayoutDestination],
    ) -> WalletResult<PayoutTx>;

    /// Add this node's signature to a payout
    async fn sign_multisig_tx(&self, trade_id: &str, tx_hex: &str) -> WalletResult<PayoutTx>;

    async fn describe_payout_tx(&self, tx_hex: &str) -> WalletResult<PayoutTx>;

    async fn close_multisig_wallet(&self, trade_id: &str) -> WalletResult<()>;
}
