//! Protocol messages
//!
//! Every message carries a [`MessageHeader`] (trade id, uid, sender address).
//! The sender's key ring travels in the delivery [`Envelope`].

use escrow_types::{EncryptedPayload, NodeAddress, Offer, PubKeyRing};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Dispute, DisputeResult, SupportType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub trade_id: String,
    pub uid: String,
    pub sender_node_address: NodeAddress,
}

impl MessageHeader {
    pub fn new(trade_id: &str, sender: &NodeAddress) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            sender_node_address: sender.clone(),
        }
    }
}

// ============================================================================
// Offer availability
// ============================================================================

/// Maker's answer to an availability request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityResult {
    Available,
    OfferTaken,
    /// Not among the maker's open offers
    OfferRemoved,
    PriceMismatch,
    AmountOutOfRange,
}

impl AvailabilityResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityResult::Available => "available",
            AvailabilityResult::OfferTaken => "offer taken",
            AvailabilityResult::OfferRemoved => "offer removed",
            AvailabilityResult::PriceMismatch => "price mismatch",
            AvailabilityResult::AmountOutOfRange => "amount out of range",
        }
    }
}

impl fmt::Display for AvailabilityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taker -> maker before taking. The header's trade id is the offer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferAvailabilityRequest {
    pub header: MessageHeader,
    pub offer_id: String,
    pub takers_trade_price: u64,
    pub trade_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferAvailabilityResponse {
    pub header: MessageHeader,
    pub offer_id: String,
    /// Uid of the request answered
    pub request_uid: String,
    pub result: AvailabilityResult,
}

// ============================================================================
// Trade initialization & multisig
// ============================================================================

/// Taker -> maker, then maker -> arbitrator. Account fields are the sender's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitTradeRequest {
    pub header: MessageHeader,
    pub offer: Offer,
    pub trade_amount: u64,
    pub price: u64,
    pub maker_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub taker_node_address: NodeAddress,
    pub taker_pub_key_ring: PubKeyRing,
    pub taker_fee: u64,
    pub payment_account_id: String,
    pub payment_account_payload_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMultisigRequest {
    pub header: MessageHeader,
    pub prepared_multisig_hex: Option<String>,
    pub made_multisig_hex: Option<String>,
    pub exchanged_multisig_hex: Option<String>,
}

// ============================================================================
// Contract & deposits
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignContractRequest {
    pub header: MessageHeader,
    pub account_id: String,
    pub payment_account_payload_hash: String,
    pub payout_address: String,
    pub deposit_tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignContractResponse {
    pub header: MessageHeader,
    pub contract_json: String,
    pub contract_signature: String,
    pub encrypted_payment_account_payload: EncryptedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub header: MessageHeader,
    pub deposit_tx_hex: String,
    pub deposit_tx_key: String,
    pub contract_signature: String,
    pub multisig_address: String,
    pub payment_account_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositResponse {
    pub header: MessageHeader,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositsConfirmedMessage {
    pub header: MessageHeader,
    pub updated_multisig_hex: String,
    /// Seller's payment account key, only when the recipient is the buyer
    pub seller_payment_account_key: Option<String>,
}

// ============================================================================
// Payment & payout
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSentMessage {
    pub header: MessageHeader,
    pub counter_currency_tx_id: Option<String>,
    /// Payout signed with the buyer's share
    pub payout_tx_hex: String,
    pub updated_multisig_hex: String,
    pub payment_account_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceivedMessage {
    pub header: MessageHeader,
    /// Fully signed payout
    pub signed_payout_tx_hex: String,
    pub updated_multisig_hex: String,
    /// Seller signature over the payout hash
    pub seller_signature: String,
}

// ============================================================================
// Support
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeOpenedMessage {
    pub header: MessageHeader,
    pub support_type: SupportType,
    pub dispute: Dispute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerOpenedDisputeMessage {
    pub header: MessageHeader,
    pub support_type: SupportType,
    pub dispute: Dispute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeClosedMessage {
    pub header: MessageHeader,
    pub support_type: SupportType,
    pub result: DisputeResult,
    /// Payout signed by the arbitrator, refund track only
    pub payout_tx_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub header: MessageHeader,
    pub support_type: SupportType,
    pub text: String,
    pub sender_is_trader: bool,
    /// Written by the node itself, never sent
    #[serde(default)]
    pub system_message: bool,

    // Local delivery flags, not meaningful on the wire
    #[serde(default)]
    pub arrived: bool,
    #[serde(default)]
    pub stored_in_mailbox: bool,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub ack_error: Option<String>,
}

impl ChatMessage {
    pub fn new(header: MessageHeader, support_type: SupportType, text: &str, sender_is_trader: bool) -> Self {
        Self {
            header,
            support_type,
            text: text.to_string(),
            sender_is_trader,
            system_message: false,
            arrived: false,
            stored_in_mailbox: false,
            acknowledged: false,
            ack_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatedPayoutTxSignatureMessage {
    pub header: MessageHeader,
    pub payout_tx_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatedPayoutTxPublishedMessage {
    pub header: MessageHeader,
    pub payout_tx_hex: String,
}

// ============================================================================
// ACK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckSourceType {
    TradeMessage,
    MediationMessage,
    RefundMessage,
    TradeChatMessage,
}

impl AckSourceType {
    pub fn for_support(support_type: SupportType) -> Self {
        match support_type {
            SupportType::Mediation => AckSourceType::MediationMessage,
            SupportType::Refund => AckSourceType::RefundMessage,
            SupportType::Trade => AckSourceType::TradeChatMessage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub header: MessageHeader,
    pub source_type: AckSourceType,
    pub source_msg_class_name: String,
    pub source_uid: String,
    /// Trade id of the acknowledged message
    pub source_id: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl AckMessage {
    pub fn for_message(
        source: &Message,
        sender: &NodeAddress,
        success: bool,
        error_message: Option<String>,
    ) -> Self {
        let source_header = source.header();
        Self {
            header: MessageHeader::new(&source_header.trade_id, sender),
            source_type: source.ack_source_type(),
            source_msg_class_name: source.class_name().to_string(),
            source_uid: source_header.uid.clone(),
            source_id: source_header.trade_id.clone(),
            success,
            error_message,
        }
    }
}

// ============================================================================
// Message enum
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    OfferAvailabilityRequest(OfferAvailabilityRequest),
    OfferAvailabilityResponse(OfferAvailabilityResponse),
    InitTradeRequest(InitTradeRequest),
    InitMultisigRequest(InitMultisigRequest),
    SignContractRequest(SignContractRequest),
    SignContractResponse(SignContractResponse),
    DepositRequest(DepositRequest),
    DepositResponse(DepositResponse),
    DepositsConfirmed(DepositsConfirmedMessage),
    PaymentSent(PaymentSentMessage),
    PaymentReceived(PaymentReceivedMessage),
    DisputeOpened(DisputeOpenedMessage),
    PeerOpenedDispute(PeerOpenedDisputeMessage),
    DisputeClosed(DisputeClosedMessage),
    Chat(ChatMessage),
    MediatedPayoutTxSignature(MediatedPayoutTxSignatureMessage),
    MediatedPayoutTxPublished(MediatedPayoutTxPublishedMessage),
    Ack(AckMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::OfferAvailabilityRequest(m) => &m.header,
            Message::OfferAvailabilityResponse(m) => &m.header,
            Message::InitTradeRequest(m) => &m.header,
            Message::InitMultisigRequest(m) => &m.header,
            Message::SignContractRequest(m) => &m.header,
            Message::SignContractResponse(m) => &m.header,
            Message::DepositRequest(m) => &m.header,
            Message::DepositResponse(m) => &m.header,
            Message::DepositsConfirmed(m) => &m.header,
            Message::PaymentSent(m) => &m.header,
            Message::PaymentReceived(m) => &m.header,
            Message::DisputeOpened(m) => &m.header,
            Message::PeerOpenedDispute(m) => &m.header,
            Message::DisputeClosed(m) => &m.header,
            Message::Chat(m) => &m.header,
            Message::MediatedPayoutTxSignature(m) => &m.header,
            Message::MediatedPayoutTxPublished(m) => &m.header,
            Message::Ack(m) => &m.header,
        }
    }

    pub fn trade_id(&self) -> &str {
        &self.header().trade_id
    }

    pub fn uid(&self) -> &str {
        &self.header().uid
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Message::OfferAvailabilityRequest(_) => "OfferAvailabilityRequest",
            Message::OfferAvailabilityResponse(_) => "OfferAvailabilityResponse",
            Message::InitTradeRequest(_) => "InitTradeRequest",
            Message::InitMultisigRequest(_) => "InitMultisigRequest",
            Message::SignContractRequest(_) => "SignContractRequest",
            Message::SignContractResponse(_) => "SignContractResponse",
            Message::DepositRequest(_) => "DepositRequest",
            Message::DepositResponse(_) => "DepositResponse",
            Message::DepositsConfirmed(_) => "DepositsConfirmedMessage",
            Message::PaymentSent(_) => "PaymentSentMessage",
            Message::PaymentReceived(_) => "PaymentReceivedMessage",
            Message::DisputeOpened(_) => "DisputeOpenedMessage",
            Message::PeerOpenedDispute(_) => "PeerOpenedDisputeMessage",
            Message::DisputeClosed(_) => "DisputeClosedMessage",
            Message::Chat(_) => "ChatMessage",
            Message::MediatedPayoutTxSignature(_) => "MediatedPayoutTxSignatureMessage",
            Message::MediatedPayoutTxPublished(_) => "MediatedPayoutTxPublishedMessage",
            Message::Ack(_) => "AckMessage",
        }
    }

    /// Support type of dispute-track messages
    pub fn support_type(&self) -> Option<SupportType> {
        match self {
            Message::DisputeOpened(m) => Some(m.support_type),
            Message::PeerOpenedDispute(m) => Some(m.support_type),
            Message::DisputeClosed(m) => Some(m.support_type),
            Message::Chat(m) => Some(m.support_type),
            Message::MediatedPayoutTxSignature(_) | Message::MediatedPayoutTxPublished(_) => {
                Some(SupportType::Mediation)
            }
            _ => None,
        }
    }

    pub fn ack_source_type(&self) -> AckSourceType {
        match self.support_type() {
            Some(support_type) => AckSourceType::for_support(support_type),
            None => AckSourceType::TradeMessage,
        }
    }

    /// Position in the canonical mailbox order. Unlisted messages sort first.
    pub fn mailbox_order(&self) -> i8 {
        match self {
            Message::DepositsConfirmed(_) => 0,
            Message::PaymentSent(_) => 1,
            Message::PaymentReceived(_) => 2,
            Message::DisputeOpened(_) | Message::PeerOpenedDispute(_) => 3,
            Message::DisputeClosed(_) => 4,
            _ => -1,
        }
    }
}

/// Extract a concrete message from [`Message`]
pub trait FromMessage: Sized {
    fn from_message(message: &Message) -> Option<&Self>;
}

macro_rules! impl_from_message {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl FromMessage for $ty {
                fn from_message(message: &Message) -> Option<&Self> {
                    match message {
                        Message::$variant(m) => Some(m),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Message {
                fn from(m: $ty) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_message! {
    OfferAvailabilityRequest => OfferAvailabilityRequest,
    OfferAvailabilityResponse => OfferAvailabilityResponse,
    InitTradeRequest => InitTradeRequest,
    InitMultisigRequest => InitMultisigRequest,
    SignContractRequest => SignContractRequest,
    SignContractResponse => SignContractResponse,
    DepositRequest => DepositRequest,
    DepositResponse => DepositResponse,
    DepositsConfirmed => DepositsConfirmedMessage,
    PaymentSent => PaymentSentMessage,
    PaymentReceived => PaymentReceivedMessage,
    DisputeOpened => DisputeOpenedMessage,
    PeerOpenedDispute => PeerOpenedDisputeMessage,
    DisputeClosed => DisputeClosedMessage,
    Chat => ChatMessage,
    MediatedPayoutTxSignature => MediatedPayoutTxSignatureMessage,
    MediatedPayoutTxPublished => MediatedPayoutTxPublishedMessage,
    Ack => AckMessage,
}

/// A message as delivered, with the sender's authenticated key ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_node_address: NodeAddress, sender_pub_key_ring: PubKeyRing, message: Message) -> Self {
        Self {
            sender_node_address,
            sender_pub_key_ring,
            message,
        }
    }
}

/// Sort mailbox messages into canonical order, keeping arrival order otherwise
pub fn sort_mailbox_messages(envelopes: &mut [Envelope]) {
    envelopes.sort_by_key(|e| e.message.mailbox_order());
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_types::KeyRing;

    fn header() -> MessageHeader {
        MessageHeader::new("trade-1", &NodeAddress::new("peer.onion:9999"))
    }

    fn envelope(message: Message) -> Envelope {
        Envelope::new(
            NodeAddress::new("peer.onion:9999"),
            KeyRing::generate().pub_key_ring(),
            message,
        )
    }

    fn deposit_response() -> Message {
        DepositResponse {
            header: header(),
            error_message: None,
        }
        .into()
    }

    fn payment_sent() -> Message {
        PaymentSentMessage {
            header: header(),
            counter_currency_tx_id: None,
            payout_tx_hex: "aa".into(),
            updated_multisig_hex: "bb".into(),
            payment_account_key: "cc".into(),
        }
        .into()
    }

    fn deposits_confirmed() -> Message {
        DepositsConfirmedMessage {
            header: header(),
            updated_multisig_hex: "bb".into(),
            seller_payment_account_key: None,
        }
        .into()
    }

    fn chat(text: &str) -> Message {
        ChatMessage::new(header(), SupportType::Mediation, text, true).into()
    }

    #[test]
    fn test_mailbox_sort_is_canonical_and_stable() {
        let mut batch = vec![
            envelope(payment_sent()),
            envelope(chat("first")),
            envelope(deposits_confirmed()),
            envelope(chat("second")),
            envelope(deposit_response()),
        ];
        sort_mailbox_messages(&mut batch);
        let names: Vec<&str> = batch.iter().map(|e| e.message.class_name()).collect();
        assert_eq!(
            names,
            vec![
                "ChatMessage",
                "ChatMessage",
                "DepositResponse",
                "DepositsConfirmedMessage",
                "PaymentSentMessage"
            ]
        );
        assert!(matches!(&batch[0].message, Message::Chat(c) if c.text == "first"));
    }

    #[test]
    fn test_ack_mirrors_source() {
        let source = chat("hi");
        let ack = AckMessage::for_message(&source, &NodeAddress::new("me:1"), false, Some("no".into()));
        assert_eq!(ack.source_uid, source.uid());
        assert_eq!(ack.source_id, "trade-1");
        assert_eq!(ack.source_type, AckSourceType::MediationMessage);
        assert_eq!(ack.source_msg_class_name, "ChatMessage");
        assert!(!ack.success);
    }

    #[test]
    fn test_from_message_and_json_tag() {
        let message = payment_sent();
        assert!(PaymentSentMessage::from_message(&message).is_some());
        assert!(DepositResponse::from_message(&message).is_none());

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"PaymentSent\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
        assert_eq!(message.ack_source_type(), AckSourceType::TradeMessage);
    }

    #[test]
    fn test_trader_chat_acks_on_its_own_track() {
        let message: Message = ChatMessage::new(header(), SupportType::Trade, "hello", true).into();
        assert_eq!(message.support_type(), Some(SupportType::Trade));
        assert_eq!(message.ack_source_type(), AckSourceType::TradeChatMessage);
        assert_eq!(message.mailbox_order(), -1);

        // Local flags are not required on the wire
        let json = r#"{"type":"Chat","header":{"trade_id":"t","uid":"u","sender_node_address":"a:1"},
            "support_type":"TRADE","text":"hi","sender_is_trader":true}"#;
        let Message::Chat(parsed) = serde_json::from_str::<Message>(json).unwrap() else {
            panic!("not a chat message");
        };
        assert!(!parsed.system_message && !parsed.arrived);
    }

    #[test]
    fn test_availability_messages_are_trade_class() {
        let message: Message = OfferAvailabilityResponse {
            header: header(),
            offer_id: "trade-1".into(),
            request_uid: "req".into(),
            result: AvailabilityResult::OfferTaken,
        }
        .into();
        assert_eq!(message.class_name(), "OfferAvailabilityResponse");
        assert_eq!(message.support_type(), None);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"result\":\"OFFER_TAKEN\""));
        assert_eq!(AvailabilityResult::PriceMismatch.to_string(), "price mismatch");
    }
}
