//! Disputes and their signed results

use chrono::{DateTime, Utc};
use escrow_types::{Contract, KeyError, KeyRing, PubKeyRing};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::messages::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupportType {
    Mediation,
    Refund,
    /// Chat between the two traders, no agent involved
    Trade,
}

impl SupportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportType::Mediation => "mediation",
            SupportType::Refund => "refund",
            SupportType::Trade => "trade",
        }
    }
}

impl fmt::Display for SupportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    New,
    Open,
    Reopened,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Winner {
    Buyer,
    Seller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeReason {
    Other,
    Bug,
    Usability,
    Scam,
    ProtocolViolation,
    NoReply,
    BankProblems,
    OptionTrade,
    SellerNotResponding,
    WrongSenderAccount,
    TradeAlreadySettled,
    PeerWasLate,
}

/// Outcome of a dispute, signed by the support agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResult {
    pub trade_id: String,
    /// Short id of the trader who opened the dispute
    pub trader_id: String,
    pub winner: Winner,
    pub reason: DisputeReason,
    pub summary_notes: String,
    pub buyer_payout_amount: u64,
    pub seller_payout_amount: u64,
    pub close_date: DateTime<Utc>,
    pub agent_signature: Option<String>,
    pub agent_pub_key_ring: PubKeyRing,
}

impl DisputeResult {
    /// Text covered by the agent signature
    pub fn canonical_text(&self) -> String {
        format!(
            "trade:{}|trader:{}|winner:{:?}|reason:{:?}|buyer:{}|seller:{}|closed:{}|notes:{}",
            self.trade_id,
            self.trader_id,
            self.winner,
            self.reason,
            self.buyer_payout_amount,
            self.seller_payout_amount,
            self.close_date.timestamp(),
            self.summary_notes
        )
    }

    pub fn sign(&mut self, key_ring: &KeyRing) {
        self.agent_signature = Some(key_ring.sign(self.canonical_text().as_bytes()));
    }

    /// Verify the agent signature against the expected agent key
    pub fn verify(&self, expected_agent: &PubKeyRing) -> Result<(), KeyError> {
        if &self.agent_pub_key_ring != expected_agent {
            return Err(KeyError::VerificationFailed);
        }
        let signature = self
            .agent_signature
            .as_deref()
            .ok_or(KeyError::VerificationFailed)?;
        expected_agent.verify(self.canonical_text().as_bytes(), signature)
    }

    pub fn total_payout(&self) -> u64 {
        self.buyer_payout_amount + self.seller_payout_amount
    }
}

/// A dispute as held by a trader or the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub trade_id: String,
    pub support_type: SupportType,
    pub status: DisputeStatus,
    pub opener_pub_key_ring: PubKeyRing,
    pub opener_is_buyer: bool,
    pub opener_is_maker: bool,
    pub contract: Contract,
    pub contract_hash: String,
    pub maker_payment_account_payload_hash: String,
    pub taker_payment_account_payload_hash: String,
    pub chat: Vec<ChatMessage>,
    pub result: Option<DisputeResult>,
    pub opened_at: DateTime<Utc>,
}

impl Dispute {
    /// Append a chat message; duplicates by uid are ignored
    pub fn add_chat_message(&mut self, message: ChatMessage) -> bool {
        if self.chat.iter().any(|m| m.header.uid == message.header.uid) {
            return false;
        }
        self.chat.push(message);
        true
    }

    pub fn chat_message_mut(&mut self, uid: &str) -> Option<&mut ChatMessage> {
        self.chat.iter_mut().find(|m| m.header.uid == uid)
    }

    /// First sight by the agent moves a new dispute to open
    pub fn mark_seen(&mut self) {
        if self.status == DisputeStatus::New {
            self.status = DisputeStatus::Open;
        }
    }

    pub fn reopen(&mut self) {
        self.status = DisputeStatus::Reopened;
        self.result = None;
    }

    pub fn close(&mut self, result: DisputeResult) {
        self.status = DisputeStatus::Closed;
        self.result = Some(result);
    }

    pub fn is_closed(&self) -> bool {
        self.status == DisputeStatus::Closed
    }
}
