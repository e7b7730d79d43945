//! Roles, sides and the per-variant rule table
//!
//! A trade is driven the same way for every party; what differs between the
//! maker-buyer, maker-seller, taker-buyer, taker-seller and arbitrator
//! variants lives in one static [`VariantRules`] entry each.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{DisputeState, State};
use super::trade::Trade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Maker,
    Taker,
    Arbitrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
            Role::Arbitrator => "arbitrator",
        }
    }

    pub fn is_trader(&self) -> bool {
        !matches!(self, Role::Arbitrator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "maker" => Ok(Role::Maker),
            "taker" => Ok(Role::Taker),
            "arbitrator" => Ok(Role::Arbitrator),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buyer,
    Seller,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buyer => "buyer",
            Side::Seller => "seller",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buyer => Side::Seller,
            Side::Seller => Side::Buyer,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a trader given the offer direction. The arbitrator has none.
pub fn side_of(role: Role, is_buy_offer: bool) -> Option<Side> {
    match (role, is_buy_offer) {
        (Role::Arbitrator, _) => None,
        (Role::Maker, true) | (Role::Taker, false) => Some(Side::Buyer),
        (Role::Maker, false) | (Role::Taker, true) => Some(Side::Seller),
    }
}

// ============================================================================
// Variant rules
// ============================================================================

/// Behavior that differs per (Role, Side)
pub struct VariantRules {
    pub name: &'static str,
    /// The two parties whose multisig blobs this party consumes, in wallet order
    pub multisig_peers: [Role; 2],
    permitted: fn(State) -> bool,
    payout_amount: fn(&Trade) -> u64,
    deposit_send_amount: fn(&Trade) -> u64,
    confirm_permitted: fn(&Trade) -> bool,
}

impl VariantRules {
    pub fn permits(&self, state: State) -> bool {
        (self.permitted)(state)
    }

    /// What this party receives from a regular (undisputed) payout
    pub fn payout_amount(&self, trade: &Trade) -> u64 {
        (self.payout_amount)(trade)
    }

    /// Principal this party sends into the multisig besides its security deposit
    pub fn deposit_send_amount(&self, trade: &Trade) -> u64 {
        (self.deposit_send_amount)(trade)
    }

    /// Whether this party may confirm the payment step (sent or received)
    pub fn confirm_permitted(&self, trade: &Trade) -> bool {
        (self.confirm_permitted)(trade)
    }
}

fn common_state(state: State) -> bool {
    use State::*;
    matches!(
        state,
        Preparation
            | MultisigPrepared
            | MultisigMade
            | MultisigExchanged
            | MultisigCompleted
            | ContractSigned
            | ArbitratorPublishedDepositTxs
            | DepositTxsSeenInNetwork
            | DepositTxsConfirmedInBlockchain
            | DepositTxsUnlockedInBlockchain
            | PayoutPublished
            | TradeCompleted
    )
}

fn trader_state(state: State) -> bool {
    use State::*;
    common_state(state)
        || matches!(
            state,
            ContractSignatureRequested
                | SentPublishDepositTxRequest
                | SendFailedPublishDepositTxRequest
                | SawArrivedPublishDepositTxRequest
                | PublishDepositTxRequestFailed
        )
}

fn buyer_state(state: State) -> bool {
    use State::*;
    trader_state(state)
        || matches!(
            state,
            BuyerConfirmedInUiPaymentSent
                | BuyerSentPaymentSentMsg
                | BuyerSendFailedPaymentSentMsg
                | BuyerStoredInMailboxPaymentSentMsg
                | BuyerSawArrivedPaymentSentMsg
                | BuyerReceivedPaymentReceivedMsg
        )
}

fn seller_state(state: State) -> bool {
    use State::*;
    trader_state(state)
        || matches!(
            state,
            SellerReceivedPaymentSentMsg
                | SellerConfirmedInUiPaymentReceipt
                | SellerSentPaymentReceivedMsg
                | SellerSendFailedPaymentReceivedMsg
                | SellerStoredInMailboxPaymentReceivedMsg
                | SellerSawArrivedPaymentReceivedMsg
        )
}

fn arbitrator_state(state: State) -> bool {
    common_state(state)
        || matches!(
            state,
            State::BuyerSentPaymentSentMsg | State::SellerSentPaymentReceivedMsg
        )
}

fn buyer_payout(trade: &Trade) -> u64 {
    trade.amount + trade.buyer_security_deposit
}

fn seller_payout(trade: &Trade) -> u64 {
    trade.seller_security_deposit
}

fn no_amount(_: &Trade) -> u64 {
    0
}

fn trade_amount(trade: &Trade) -> u64 {
    trade.amount
}

fn always(_: &Trade) -> bool {
    true
}

fn seller_confirm_permitted(trade: &Trade) -> bool {
    if trade.offer.is_crypto_counter_currency() || trade.dispute_state == DisputeState::NoDispute {
        return true;
    }
    if trade.dispute_state == DisputeState::MediationClosed {
        return match &trade.process_model.mediated_payout {
            Some(split) => split.seller_amount >= trade.seller_security_deposit,
            None => true,
        };
    }
    false
}

pub static MAKER_BUYER: VariantRules = VariantRules {
    name: "maker-as-buyer",
    multisig_peers: [Role::Arbitrator, Role::Taker],
    permitted: buyer_state,
    payout_amount: buyer_payout,
    deposit_send_amount: no_amount,
    confirm_permitted: always,
};

pub static MAKER_SELLER: VariantRules = VariantRules {
    name: "maker-as-seller",
    multisig_peers: [Role::Arbitrator, Role::Taker],
    permitted: seller_state,
    payout_amount: seller_payout,
    deposit_send_amount: trade_amount,
    confirm_permitted: seller_confirm_permitted,
};

pub static TAKER_BUYER: VariantRules = VariantRules {
    name: "taker-as-buyer",
    multisig_peers: [Role::Arbitrator, Role::Maker],
    permitted: buyer_state,
    payout_amount: buyer_payout,
    deposit_send_amount: no_amount,
    confirm_permitted: always,
};

pub static TAKER_SELLER: VariantRules = VariantRules {
    name: "taker-as-seller",
    multisig_peers: [Role::Arbitrator, Role::Maker],
    permitted: seller_state,
    payout_amount: seller_payout,
    deposit_send_amount: trade_amount,
    confirm_permitted: seller_confirm_permitted,
};

pub static ARBITRATOR: VariantRules = VariantRules {
    name: "arbitrator",
    multisig_peers: [Role::Taker, Role::Maker],
    permitted: arbitrator_state,
    payout_amount: no_amount,
    deposit_send_amount: no_amount,
    confirm_permitted: always,
};

pub fn rules_for(role: Role, side: Option<Side>) -> &'static VariantRules {
    match (role, side) {
        (Role::Maker, Some(Side::Buyer)) => &MAKER_BUYER,
        (Role::Maker, Some(Side::Seller)) => &MAKER_SELLER,
        (Role::Taker, Some(Side::Buyer)) => &TAKER_BUYER,
        (Role::Taker, Some(Side::Seller)) => &TAKER_SELLER,
        _ => &ARBITRATOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_direction() {
        assert_eq!(side_of(Role::Maker, true), Some(Side::Buyer));
        assert_eq!(side_of(Role::Taker, true), Some(Side::Seller));
        assert_eq!(side_of(Role::Maker, false), Some(Side::Seller));
        assert_eq!(side_of(Role::Taker, false), Some(Side::Buyer));
        assert_eq!(side_of(Role::Arbitrator, true), None);
    }

    #[test]
    fn test_permitted_states_per_variant() {
        assert!(MAKER_BUYER.permits(State::BuyerSentPaymentSentMsg));
        assert!(!MAKER_BUYER.permits(State::SellerReceivedPaymentSentMsg));
        assert!(TAKER_SELLER.permits(State::SellerSentPaymentReceivedMsg));
        assert!(!TAKER_SELLER.permits(State::BuyerConfirmedInUiPaymentSent));

        assert!(!ARBITRATOR.permits(State::ContractSignatureRequested));
        assert!(!ARBITRATOR.permits(State::SentPublishDepositTxRequest));
        assert!(!ARBITRATOR.permits(State::BuyerConfirmedInUiPaymentSent));
        assert!(ARBITRATOR.permits(State::BuyerSentPaymentSentMsg));
        assert!(ARBITRATOR.permits(State::SellerSentPaymentReceivedMsg));

        for rules in [&MAKER_BUYER, &MAKER_SELLER, &TAKER_BUYER, &TAKER_SELLER, &ARBITRATOR] {
            assert!(rules.permits(State::MultisigCompleted), "{}", rules.name);
            assert!(rules.permits(State::TradeCompleted), "{}", rules.name);
        }
    }

    #[test]
    fn test_multisig_peers_exclude_self() {
        assert!(!MAKER_SELLER.multisig_peers.contains(&Role::Maker));
        assert!(!TAKER_BUYER.multisig_peers.contains(&Role::Taker));
        assert!(!ARBITRATOR.multisig_peers.contains(&Role::Arbitrator));
        assert_eq!(rules_for(Role::Arbitrator, None).name, "arbitrator");
    }
}
