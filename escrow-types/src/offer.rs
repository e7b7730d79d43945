//! Offers posted by makers
//!
//! The offer fixes the trade terms every party later recomputes on its own:
//! security deposits are derived from the offer percentages and the trade
//! amount, never taken from a peer's message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::currency::{is_crypto_currency, ATOMIC_UNITS_PER_COIN};
use crate::keys::{NodeAddress, PubKeyRing};

/// Floor for either security deposit (0.1 coin)
pub const MIN_SECURITY_DEPOSIT: u64 = ATOMIC_UNITS_PER_COIN / 10;

/// Direction from the maker's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferDirection {
    /// Maker buys the base currency
    Buy,
    /// Maker sells the base currency
    Sell,
}

impl OfferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferDirection::Buy => "BUY",
            OfferDirection::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OfferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub direction: OfferDirection,
    pub currency_code: String,
    /// Counter-currency minor units per whole coin
    pub price: u64,
    /// Maximum tradable amount in atomic units
    pub amount: u64,
    pub min_amount: u64,
    pub buyer_security_deposit_pct: f64,
    pub seller_security_deposit_pct: f64,
    pub maker_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub arbitrator_node_address: NodeAddress,
    pub arbitrator_pub_key_ring: PubKeyRing,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    /// A BUY offer makes the maker the buyer
    pub fn is_buy_offer(&self) -> bool {
        self.direction == OfferDirection::Buy
    }

    pub fn is_amount_in_range(&self, amount: u64) -> bool {
        amount >= self.min_amount && amount <= self.amount
    }

    pub fn is_crypto_counter_currency(&self) -> bool {
        is_crypto_currency(&self.currency_code)
    }

    pub fn buyer_security_deposit(&self, trade_amount: u64) -> u64 {
        security_deposit(self.buyer_security_deposit_pct, trade_amount)
    }

    pub fn seller_security_deposit(&self, trade_amount: u64) -> u64 {
        security_deposit(self.seller_security_deposit_pct, trade_amount)
    }

    /// Counter-currency volume for `trade_amount` at the offer price
    pub fn volume(&self, trade_amount: u64) -> u64 {
        ((trade_amount as u128 * self.price as u128) / ATOMIC_UNITS_PER_COIN as u128) as u64
    }
}

fn security_deposit(pct: f64, trade_amount: u64) -> u64 {
    let computed = (trade_amount as f64 * pct).round() as u64;
    computed.max(MIN_SECURITY_DEPOSIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRing;

    fn sample_offer() -> Offer {
        Offer {
            id: "offer-1".to_string(),
            direction: OfferDirection::Sell,
            currency_code: "EUR".to_string(),
            price: 15_000,
            amount: 2 * ATOMIC_UNITS_PER_COIN,
            min_amount: ATOMIC_UNITS_PER_COIN / 2,
            buyer_security_deposit_pct: 0.15,
            seller_security_deposit_pct: 0.15,
            maker_node_address: NodeAddress::new("maker.onion:9999"),
            maker_pub_key_ring: KeyRing::generate().pub_key_ring(),
            arbitrator_node_address: NodeAddress::new("arbitrator.onion:9999"),
            arbitrator_pub_key_ring: KeyRing::generate().pub_key_ring(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_security_deposit_percentage() {
        let offer = sample_offer();
        assert_eq!(
            offer.buyer_security_deposit(ATOMIC_UNITS_PER_COIN),
            150_000_000_000
        );
    }

    #[test]
    fn test_security_deposit_floor() {
        let offer = sample_offer();
        assert_eq!(
            offer.seller_security_deposit(ATOMIC_UNITS_PER_COIN / 100),
            MIN_SECURITY_DEPOSIT
        );
    }

    #[test]
    fn test_amount_range() {
        let offer = sample_offer();
        assert!(offer.is_amount_in_range(ATOMIC_UNITS_PER_COIN));
        assert!(!offer.is_amount_in_range(ATOMIC_UNITS_PER_COIN / 4));
        assert!(!offer.is_amount_in_range(3 * ATOMIC_UNITS_PER_COIN));
    }

    #[test]
    fn test_volume_at_price() {
        let offer = sample_offer();
        assert_eq!(offer.volume(ATOMIC_UNITS_PER_COIN), 15_000);
        assert_eq!(offer.volume(ATOMIC_UNITS_PER_COIN / 2), 7_500);
        assert!(!offer.is_buy_offer());
    }
}
