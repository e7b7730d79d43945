//! Trade contract
//!
//! Immutable snapshot of the agreed terms. All three parties build it from the
//! same inputs once multisig setup completes, so the JSON form (and its hash)
//! is identical everywhere. Both traders sign the JSON.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{KeyError, KeyRing, NodeAddress, PubKeyRing};
use crate::offer::OfferDirection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub offer_id: String,
    pub direction: OfferDirection,
    pub currency_code: String,
    pub price: u64,
    pub trade_amount: u64,
    pub maker_fee: u64,
    pub taker_fee: u64,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,

    pub maker_node_address: NodeAddress,
    pub taker_node_address: NodeAddress,
    pub arbitrator_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub taker_pub_key_ring: PubKeyRing,
    pub arbitrator_pub_key_ring: PubKeyRing,

    pub maker_account_id: String,
    pub taker_account_id: String,
    pub maker_payment_account_payload_hash: String,
    pub taker_payment_account_payload_hash: String,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
    pub maker_deposit_tx_hash: String,
    pub taker_deposit_tx_hash: String,

    pub multisig_address: String,
}

impl Contract {
    pub fn is_buyer_maker_and_seller_taker(&self) -> bool {
        self.direction == OfferDirection::Buy
    }

    pub fn buyer_pub_key_ring(&self) -> &PubKeyRing {
        if self.is_buyer_maker_and_seller_taker() {
            &self.maker_pub_key_ring
        } else {
            &self.taker_pub_key_ring
        }
    }

    pub fn seller_pub_key_ring(&self) -> &PubKeyRing {
        if self.is_buyer_maker_and_seller_taker() {
            &self.taker_pub_key_ring
        } else {
            &self.maker_pub_key_ring
        }
    }

    pub fn buyer_node_address(&self) -> &NodeAddress {
        if self.is_buyer_maker_and_seller_taker() {
            &self.maker_node_address
        } else {
            &self.taker_node_address
        }
    }

    pub fn seller_node_address(&self) -> &NodeAddress {
        if self.is_buyer_maker_and_seller_taker() {
            &self.taker_node_address
        } else {
            &self.maker_node_address
        }
    }

    pub fn buyer_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker() {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker() {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }

    pub fn buyer_payment_account_payload_hash(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker() {
            &self.maker_payment_account_payload_hash
        } else {
            &self.taker_payment_account_payload_hash
        }
    }

    pub fn seller_payment_account_payload_hash(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker() {
            &self.taker_payment_account_payload_hash
        } else {
            &self.maker_payment_account_payload_hash
        }
    }

    /// Whether `key` belongs to one of the two traders
    pub fn is_trader(&self, key: &PubKeyRing) -> bool {
        &self.maker_pub_key_ring == key || &self.taker_pub_key_ring == key
    }

    /// Everything locked in the multisig: amount plus both security deposits
    pub fn total_escrowed(&self) -> u64 {
        self.trade_amount + self.buyer_security_deposit + self.seller_security_deposit
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn hash_json(contract_json: &str) -> String {
        hex::encode(Sha256::digest(contract_json.as_bytes()))
    }
}

pub fn sign_contract(key_ring: &KeyRing, contract_json: &str) -> String {
    key_ring.sign(contract_json.as_bytes())
}

pub fn verify_contract_signature(
    signer: &PubKeyRing,
    contract_json: &str,
    signature: &str,
) -> Result<(), KeyError> {
    signer.verify(contract_json.as_bytes(), signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(direction: OfferDirection, maker: &KeyRing, taker: &KeyRing) -> Contract {
        Contract {
            offer_id: "offer-1".to_string(),
            direction,
            currency_code: "EUR".to_string(),
            price: 15_000,
            trade_amount: 1_000,
            maker_fee: 2,
            taker_fee: 7,
            buyer_security_deposit: 150,
            seller_security_deposit: 150,
            maker_node_address: NodeAddress::new("maker.onion:9999"),
            taker_node_address: NodeAddress::new("taker.onion:9999"),
            arbitrator_node_address: NodeAddress::new("arb.onion:9999"),
            maker_pub_key_ring: maker.pub_key_ring(),
            taker_pub_key_ring: taker.pub_key_ring(),
            arbitrator_pub_key_ring: KeyRing::from_secret_bytes(&[9u8; 32]).pub_key_ring(),
            maker_account_id: "maker-acct".to_string(),
            taker_account_id: "taker-acct".to_string(),
            maker_payment_account_payload_hash: "mh".to_string(),
            taker_payment_account_payload_hash: "th".to_string(),
            maker_payout_address: "maker-payout".to_string(),
            taker_payout_address: "taker-payout".to_string(),
            maker_deposit_tx_hash: "md".to_string(),
            taker_deposit_tx_hash: "td".to_string(),
            multisig_address: "4multisig".to_string(),
        }
    }

    #[test]
    fn test_buyer_seller_resolution_for_sell_offer() {
        let maker = KeyRing::generate();
        let taker = KeyRing::generate();
        let c = contract(OfferDirection::Sell, &maker, &taker);
        assert_eq!(c.buyer_payout_address(), "taker-payout");
        assert_eq!(c.seller_payout_address(), "maker-payout");
        assert_eq!(c.buyer_pub_key_ring(), &taker.pub_key_ring());
        assert_eq!(c.seller_payment_account_payload_hash(), "mh");
    }

    #[test]
    fn test_buyer_seller_resolution_for_buy_offer() {
        let maker = KeyRing::generate();
        let taker = KeyRing::generate();
        let c = contract(OfferDirection::Buy, &maker, &taker);
        assert_eq!(c.buyer_node_address().as_str(), "maker.onion:9999");
        assert_eq!(c.seller_node_address().as_str(), "taker.onion:9999");
        assert_eq!(c.total_escrowed(), 1_300);
    }

    #[test]
    fn test_identical_inputs_give_identical_hash() {
        let maker = KeyRing::from_secret_bytes(&[1u8; 32]);
        let taker = KeyRing::from_secret_bytes(&[2u8; 32]);
        let a = contract(OfferDirection::Sell, &maker, &taker).to_json().unwrap();
        let b = contract(OfferDirection::Sell, &maker, &taker).to_json().unwrap();
        assert_eq!(Contract::hash_json(&a), Contract::hash_json(&b));
    }

    #[test]
    fn test_contract_signature() {
        let maker = KeyRing::generate();
        let taker = KeyRing::generate();
        let json = contract(OfferDirection::Sell, &maker, &taker).to_json().unwrap();
        let signature = sign_contract(&maker, &json);
        assert!(verify_contract_signature(&maker.pub_key_ring(), &json, &signature).is_ok());
        assert!(verify_contract_signature(&taker.pub_key_ring(), &json, &signature).is_err());
    }
}
