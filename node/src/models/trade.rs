//! The trade entity

use chrono::{DateTime, Utc};
use escrow_types::{Contract, NodeAddress, Offer, PubKeyRing};
use escrow_wallet::PayoutDestination;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::dispute::{Dispute, SupportType};
use super::process_model::ProcessModel;
use super::role::{rules_for, side_of, Role, Side, VariantRules};
use super::state::{DisputeState, MediationResultState, PayoutState, Phase, State};
use super::trading_peer::TradingPeer;
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::messages::ChatMessage;

/// Result of a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    Applied,
    /// Equal or lower than the current state
    Ignored,
    /// Never passed through by this trade's variant
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Equals the offer id
    pub id: String,
    pub uid: String,
    pub offer: Offer,
    pub role: Role,

    pub amount: u64,
    pub price: u64,
    pub maker_fee: u64,
    pub taker_fee: u64,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,

    state: State,
    phase: Phase,
    pub dispute_state: DisputeState,
    pub mediation_result_state: MediationResultState,
    pub payout_state: PayoutState,

    pub contract: Option<Contract>,
    pub contract_json: Option<String>,
    pub contract_hash: Option<String>,

    pub payout_tx_hash: Option<String>,
    pub payout_tx_hex: Option<String>,
    pub counter_currency_tx_id: Option<String>,

    pub error_message: Option<String>,
    pub disputes: Vec<Dispute>,
    /// Chat with the other trader, open while the trade is
    #[serde(default)]
    pub chat_messages: Vec<ChatMessage>,
    pub process_model: ProcessModel,

    pub created_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Create a trade for `role` on `offer`. Maker and arbitrator identities come
    /// from the offer; this node's identity is recorded under its own role.
    pub fn new(
        offer: Offer,
        role: Role,
        amount: u64,
        maker_fee: u64,
        taker_fee: u64,
        own_address: NodeAddress,
        own_key: PubKeyRing,
    ) -> Self {
        let mut process_model = ProcessModel::default();
        process_model.maker = TradingPeer::with_identity(
            offer.maker_node_address.clone(),
            offer.maker_pub_key_ring.clone(),
        );
        process_model.arbitrator = TradingPeer::with_identity(
            offer.arbitrator_node_address.clone(),
            offer.arbitrator_pub_key_ring.clone(),
        );
        let own = process_model.peer_mut(role);
        own.node_address = Some(own_address);
        own.pub_key_ring = Some(own_key);

        Self {
            id: offer.id.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            price: offer.price,
            buyer_security_deposit: offer.buyer_security_deposit(amount),
            seller_security_deposit: offer.seller_security_deposit(amount),
            offer,
            role,
            amount,
            maker_fee,
            taker_fee,
            state: State::Preparation,
            phase: Phase::Init,
            dispute_state: DisputeState::NoDispute,
            mediation_result_state: MediationResultState::Undefined,
            payout_state: PayoutState::PayoutUnpublished,
            contract: None,
            contract_json: None,
            contract_hash: None,
            payout_tx_hash: None,
            payout_tx_hex: None,
            counter_currency_tx_id: None,
            error_message: None,
            disputes: Vec::new(),
            chat_messages: Vec::new(),
            process_model,
            created_at: Utc::now(),
            failed_at: None,
            closed_at: None,
        }
    }

    // ------------------------------------------------------------------
    // Role & side
    // ------------------------------------------------------------------

    pub fn side(&self) -> Option<Side> {
        side_of(self.role, self.offer.is_buy_offer())
    }

    pub fn rules(&self) -> &'static VariantRules {
        rules_for(self.role, self.side())
    }

    pub fn is_arbitrator(&self) -> bool {
        self.role == Role::Arbitrator
    }

    pub fn is_buyer(&self) -> bool {
        self.side() == Some(Side::Buyer)
    }

    pub fn is_seller(&self) -> bool {
        self.side() == Some(Side::Seller)
    }

    pub fn role_of_side(&self, side: Side) -> Role {
        match (side, self.offer.is_buy_offer()) {
            (Side::Buyer, true) | (Side::Seller, false) => Role::Maker,
            _ => Role::Taker,
        }
    }

    pub fn buyer_role(&self) -> Role {
        self.role_of_side(Side::Buyer)
    }

    pub fn seller_role(&self) -> Role {
        self.role_of_side(Side::Seller)
    }

    /// The other trader, for a trader node
    pub fn trade_peer_role(&self) -> Option<Role> {
        match self.role {
            Role::Maker => Some(Role::Taker),
            Role::Taker => Some(Role::Maker),
            Role::Arbitrator => None,
        }
    }

    pub fn security_deposit_of(&self, side: Side) -> u64 {
        match side {
            Side::Buyer => self.buyer_security_deposit,
            Side::Seller => self.seller_security_deposit,
        }
    }

    pub fn trade_fee_of(&self, role: Role) -> u64 {
        match role {
            Role::Maker => self.maker_fee,
            Role::Taker => self.taker_fee,
            Role::Arbitrator => 0,
        }
    }

    // ------------------------------------------------------------------
    // Progression
    // ------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move forward to `state`. Lower or equal states are ignored, states the
    /// variant never passes through are rejected.
    pub fn set_state(&mut self, state: State) -> StateTransition {
        let rules = self.rules();
        if !rules.permits(state) {
            error!(
                trade_id = %crate::log_trade_id!(&self.id),
                state = %state,
                variant = rules.name,
                "State not permitted for trade variant"
            );
            return StateTransition::Rejected;
        }
        if state <= self.state {
            if state < self.state {
                warn!(
                    trade_id = %crate::log_trade_id!(&self.id),
                    current = %self.state,
                    requested = %state,
                    "Ignoring attempt to move trade state backwards"
                );
            }
            return StateTransition::Ignored;
        }

        info!(
            trade_id = %crate::log_trade_id!(&self.id),
            role = %self.role,
            from = %self.state,
            to = %state,
            "Trade state changed"
        );
        self.state = state;
        if state.phase() > self.phase {
            self.phase = state.phase();
        }
        StateTransition::Applied
    }

    /// Same as [`Trade::set_state`] but rejection becomes an error
    pub fn advance_state(&mut self, state: State) -> ProtocolResult<StateTransition> {
        match self.set_state(state) {
            StateTransition::Rejected => Err(ProtocolError::StateNotPermitted {
                state,
                variant: self.rules().name,
            }),
            transition => Ok(transition),
        }
    }

    pub fn set_dispute_state(&mut self, dispute_state: DisputeState) {
        if dispute_state != self.dispute_state {
            info!(
                trade_id = %crate::log_trade_id!(&self.id),
                from = %self.dispute_state,
                to = %dispute_state,
                "Dispute state changed"
            );
            self.dispute_state = dispute_state;
        }
    }

    pub fn set_payout_state(&mut self, payout_state: PayoutState) {
        if payout_state > self.payout_state {
            self.payout_state = payout_state;
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == State::TradeCompleted
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed() || self.is_closed()
    }

    /// Record a terminal failure; returns false if already failed
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        self.error_message = Some(error.into());
        if self.failed_at.is_some() {
            return false;
        }
        self.failed_at = Some(Utc::now());
        true
    }

    /// Close through dispute resolution; returns false if already closed
    pub fn mark_closed(&mut self) -> bool {
        if self.closed_at.is_some() {
            return false;
        }
        self.closed_at = Some(Utc::now());
        true
    }

    // ------------------------------------------------------------------
    // Peers & artifacts
    // ------------------------------------------------------------------

    pub fn peer(&self, role: Role) -> &TradingPeer {
        self.process_model.peer(role)
    }

    pub fn peer_mut(&mut self, role: Role) -> &mut TradingPeer {
        self.process_model.peer_mut(role)
    }

    pub fn self_peer(&self) -> &TradingPeer {
        self.process_model.peer(self.role)
    }

    pub fn self_peer_mut(&mut self) -> &mut TradingPeer {
        self.process_model.peer_mut(self.role)
    }

    pub fn multisig_address(&self) -> ProtocolResult<&str> {
        self.process_model
            .multisig_address()
            .ok_or_else(|| ProtocolError::MissingData("multisig address".into()))
    }

    pub fn contract(&self) -> ProtocolResult<&Contract> {
        self.contract
            .as_ref()
            .ok_or_else(|| ProtocolError::MissingData("contract".into()))
    }

    pub fn contract_json(&self) -> ProtocolResult<&str> {
        self.contract_json
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingData("contract json".into()))
    }

    /// Gross payout destinations for a buyer/seller split, per the contract
    pub fn payout_destinations(
        &self,
        buyer_amount: u64,
        seller_amount: u64,
    ) -> ProtocolResult<Vec<PayoutDestination>> {
        let contract = self.contract()?;
        Ok(vec![
            PayoutDestination::new(contract.buyer_payout_address(), buyer_amount),
            PayoutDestination::new(contract.seller_payout_address(), seller_amount),
        ])
    }

    /// Destinations of the regular payout
    pub fn regular_payout_destinations(&self) -> ProtocolResult<Vec<PayoutDestination>> {
        self.payout_destinations(
            self.amount + self.buyer_security_deposit,
            self.seller_security_deposit,
        )
    }

    pub fn total_escrowed(&self) -> u64 {
        self.amount + self.buyer_security_deposit + self.seller_security_deposit
    }

    pub fn dispute(&self, support_type: SupportType) -> Option<&Dispute> {
        self.disputes.iter().find(|d| d.support_type == support_type)
    }

    pub fn dispute_mut(&mut self, support_type: SupportType) -> Option<&mut Dispute> {
        self.disputes
            .iter_mut()
            .find(|d| d.support_type == support_type)
    }

    /// Returns false for a uid already on record
    pub fn add_chat_message(&mut self, message: ChatMessage) -> bool {
        if self.chat_messages.iter().any(|m| m.header.uid == message.header.uid) {
            return false;
        }
        self.chat_messages.push(message);
        true
    }

    pub fn chat_message_mut(&mut self, uid: &str) -> Option<&mut ChatMessage> {
        self.chat_messages.iter_mut().find(|m| m.header.uid == uid)
    }

    /// Peer updated multisig hexes available for import
    pub fn peer_updated_multisig_hexes(&self) -> Vec<String> {
        [Role::Maker, Role::Taker, Role::Arbitrator]
            .into_iter()
            .filter(|role| *role != self.role)
            .filter_map(|role| self.peer(role).updated_multisig_hex.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use escrow_types::{KeyRing, OfferDirection, ATOMIC_UNITS_PER_COIN};

    pub(crate) fn sample_offer(direction: OfferDirection) -> Offer {
        let maker = KeyRing::generate();
        let arbitrator = KeyRing::generate();
        Offer {
            id: "offer-0000-1111-2222".into(),
            direction,
            currency_code: "EUR".into(),
            price: 150 * ATOMIC_UNITS_PER_COIN,
            amount: ATOMIC_UNITS_PER_COIN,
            min_amount: ATOMIC_UNITS_PER_COIN / 2,
            buyer_security_deposit_pct: 0.15,
            seller_security_deposit_pct: 0.15,
            maker_node_address: NodeAddress::new("maker.onion:9999"),
            maker_pub_key_ring: maker.pub_key_ring(),
            arbitrator_node_address: NodeAddress::new("arbitrator.onion:9999"),
            arbitrator_pub_key_ring: arbitrator.pub_key_ring(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn sample_trade(direction: OfferDirection, role: Role) -> Trade {
        let offer = sample_offer(direction);
        let own = KeyRing::generate();
        Trade::new(
            offer,
            role,
            ATOMIC_UNITS_PER_COIN,
            1_500_000_000,
            7_500_000_000,
            NodeAddress::new(format!("{role}.onion:9999")),
            own.pub_key_ring(),
        )
    }

    #[test]
    fn test_state_is_monotonic() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Maker);
        assert_eq!(trade.set_state(State::MultisigMade), StateTransition::Applied);
        assert_eq!(trade.set_state(State::MultisigPrepared), StateTransition::Ignored);
        assert_eq!(trade.set_state(State::MultisigMade), StateTransition::Ignored);
        assert_eq!(trade.state(), State::MultisigMade);
        assert_eq!(trade.phase(), Phase::Init);

        assert_eq!(
            trade.set_state(State::DepositTxsConfirmedInBlockchain),
            StateTransition::Applied
        );
        assert_eq!(trade.phase(), Phase::DepositsConfirmed);
    }

    #[test]
    fn test_state_not_permitted_is_rejected() {
        // BUY offer: maker is the buyer
        let mut trade = sample_trade(OfferDirection::Buy, Role::Maker);
        assert!(trade.is_buyer());
        assert_eq!(
            trade.set_state(State::SellerReceivedPaymentSentMsg),
            StateTransition::Rejected
        );
        assert_eq!(trade.state(), State::Preparation);
        assert!(matches!(
            trade.advance_state(State::SellerConfirmedInUiPaymentReceipt),
            Err(ProtocolError::StateNotPermitted { .. })
        ));

        let mut arbitrator = sample_trade(OfferDirection::Buy, Role::Arbitrator);
        assert_eq!(
            arbitrator.set_state(State::ContractSignatureRequested),
            StateTransition::Rejected
        );
    }

    #[test]
    fn test_sides_follow_offer_direction() {
        let trade = sample_trade(OfferDirection::Sell, Role::Taker);
        assert!(trade.is_buyer());
        assert_eq!(trade.buyer_role(), Role::Taker);
        assert_eq!(trade.seller_role(), Role::Maker);
        assert_eq!(trade.trade_peer_role(), Some(Role::Maker));
        assert_eq!(trade.rules().deposit_send_amount(&trade), 0);
        assert_eq!(
            trade.rules().payout_amount(&trade),
            trade.amount + trade.buyer_security_deposit
        );
    }

    #[test]
    fn test_terminal_flags_set_once() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Taker);
        assert!(trade.mark_failed("boom"));
        assert!(!trade.mark_failed("again"));
        assert_eq!(trade.error_message.as_deref(), Some("again"));
        assert!(trade.mark_closed());
        assert!(!trade.mark_closed());
        assert!(trade.is_terminal());
    }

    #[test]
    fn test_seller_confirm_blocked_by_dispute() {
        let mut trade = sample_trade(OfferDirection::Buy, Role::Taker);
        assert!(trade.is_seller());
        assert!(trade.rules().confirm_permitted(&trade));
        trade.set_dispute_state(DisputeState::MediationRequested);
        assert!(!trade.rules().confirm_permitted(&trade));

        trade.set_dispute_state(DisputeState::MediationClosed);
        trade.process_model.mediated_payout = Some(super::super::process_model::MediatedPayout {
            buyer_amount: trade.total_escrowed(),
            seller_amount: 0,
        });
        assert!(!trade.rules().confirm_permitted(&trade));
        trade.process_model.mediated_payout = Some(super::super::process_model::MediatedPayout {
            buyer_amount: trade.amount + trade.buyer_security_deposit,
            seller_amount: trade.seller_security_deposit,
        });
        assert!(trade.rules().confirm_permitted(&trade));
    }
}
