//! Trade progression tracks
//!
//! `State` is fine-grained and strictly ordered by declaration; every state
//! belongs to exactly one `Phase`. Dispute, mediation result and payout are
//! tracked separately.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Phase
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    DepositsPublished,
    DepositsConfirmed,
    DepositsUnlocked,
    PaymentSent,
    PaymentReceived,
    PayoutPublished,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::DepositsPublished => "DEPOSITS_PUBLISHED",
            Phase::DepositsConfirmed => "DEPOSITS_CONFIRMED",
            Phase::DepositsUnlocked => "DEPOSITS_UNLOCKED",
            Phase::PaymentSent => "PAYMENT_SENT",
            Phase::PaymentReceived => "PAYMENT_RECEIVED",
            Phase::PayoutPublished => "PAYOUT_PUBLISHED",
            Phase::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    // Init
    Preparation,
    MultisigPrepared,
    MultisigMade,
    MultisigExchanged,
    MultisigCompleted,
    ContractSignatureRequested,
    ContractSigned,
    SentPublishDepositTxRequest,
    SendFailedPublishDepositTxRequest,
    SawArrivedPublishDepositTxRequest,
    PublishDepositTxRequestFailed,

    // Deposits published
    ArbitratorPublishedDepositTxs,
    DepositTxsSeenInNetwork,

    DepositTxsConfirmedInBlockchain,
    DepositTxsUnlockedInBlockchain,

    // Payment sent
    BuyerConfirmedInUiPaymentSent,
    BuyerSentPaymentSentMsg,
    BuyerSendFailedPaymentSentMsg,
    BuyerStoredInMailboxPaymentSentMsg,
    BuyerSawArrivedPaymentSentMsg,
    SellerReceivedPaymentSentMsg,

    // Payment received
    SellerConfirmedInUiPaymentReceipt,
    SellerSentPaymentReceivedMsg,
    SellerSendFailedPaymentReceivedMsg,
    SellerStoredInMailboxPaymentReceivedMsg,
    SellerSawArrivedPaymentReceivedMsg,
    BuyerReceivedPaymentReceivedMsg,

    PayoutPublished,
    TradeCompleted,
}

impl State {
    pub const ALL: [State; 29] = [
        State::Preparation,
        State::MultisigPrepared,
        State::MultisigMade,
        State::MultisigExchanged,
        State::MultisigCompleted,
        State::ContractSignatureRequested,
        State::ContractSigned,
        State::SentPublishDepositTxRequest,
        State::SendFailedPublishDepositTxRequest,
        State::SawArrivedPublishDepositTxRequest,
        State::PublishDepositTxRequestFailed,
        State::ArbitratorPublishedDepositTxs,
        State::DepositTxsSeenInNetwork,
        State::DepositTxsConfirmedInBlockchain,
        State::DepositTxsUnlockedInBlockchain,
        State::BuyerConfirmedInUiPaymentSent,
        State::BuyerSentPaymentSentMsg,
        State::BuyerSendFailedPaymentSentMsg,
        State::BuyerStoredInMailboxPaymentSentMsg,
        State::BuyerSawArrivedPaymentSentMsg,
        State::SellerReceivedPaymentSentMsg,
        State::SellerConfirmedInUiPaymentReceipt,
        State::SellerSentPaymentReceivedMsg,
        State::SellerSendFailedPaymentReceivedMsg,
        State::SellerStoredInMailboxPaymentReceivedMsg,
        State::SellerSawArrivedPaymentReceivedMsg,
        State::BuyerReceivedPaymentReceivedMsg,
        State::PayoutPublished,
        State::TradeCompleted,
    ];

    pub fn phase(&self) -> Phase {
        use State::*;
        match self {
            Preparation
            | MultisigPrepared
            | MultisigMade
            | MultisigExchanged
            | MultisigCompleted
            | ContractSignatureRequested
            | ContractSigned
            | SentPublishDepositTxRequest
            | SendFailedPublishDepositTxRequest
            | SawArrivedPublishDepositTxRequest
            | PublishDepositTxRequestFailed => Phase::Init,
            ArbitratorPublishedDepositTxs | DepositTxsSeenInNetwork => Phase::DepositsPublished,
            DepositTxsConfirmedInBlockchain => Phase::DepositsConfirmed,
            DepositTxsUnlockedInBlockchain => Phase::DepositsUnlocked,
            BuyerConfirmedInUiPaymentSent
            | BuyerSentPaymentSentMsg
            | BuyerSendFailedPaymentSentMsg
            | BuyerStoredInMailboxPaymentSentMsg
            | BuyerSawArrivedPaymentSentMsg
            | SellerReceivedPaymentSentMsg => Phase::PaymentSent,
            SellerConfirmedInUiPaymentReceipt
            | SellerSentPaymentReceivedMsg
            | SellerSendFailedPaymentReceivedMsg
            | SellerStoredInMailboxPaymentReceivedMsg
            | SellerSawArrivedPaymentReceivedMsg
            | BuyerReceivedPaymentReceivedMsg => Phase::PaymentReceived,
            PayoutPublished => Phase::PayoutPublished,
            TradeCompleted => Phase::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use State::*;
        match self {
            Preparation => "PREPARATION",
            MultisigPrepared => "MULTISIG_PREPARED",
            MultisigMade => "MULTISIG_MADE",
            MultisigExchanged => "MULTISIG_EXCHANGED",
            MultisigCompleted => "MULTISIG_COMPLETED",
            ContractSignatureRequested => "CONTRACT_SIGNATURE_REQUESTED",
            ContractSigned => "CONTRACT_SIGNED",
            SentPublishDepositTxRequest => "SENT_PUBLISH_DEPOSIT_TX_REQUEST",
            SendFailedPublishDepositTxRequest => "SEND_FAILED_PUBLISH_DEPOSIT_TX_REQUEST",
            SawArrivedPublishDepositTxRequest => "SAW_ARRIVED_PUBLISH_DEPOSIT_TX_REQUEST",
            PublishDepositTxRequestFailed => "PUBLISH_DEPOSIT_TX_REQUEST_FAILED",
            ArbitratorPublishedDepositTxs => "ARBITRATOR_PUBLISHED_DEPOSIT_TXS",
            DepositTxsSeenInNetwork => "DEPOSIT_TXS_SEEN_IN_NETWORK",
            DepositTxsConfirmedInBlockchain => "DEPOSIT_TXS_CONFIRMED_IN_BLOCKCHAIN",
            DepositTxsUnlockedInBlockchain => "DEPOSIT_TXS_UNLOCKED_IN_BLOCKCHAIN",
            BuyerConfirmedInUiPaymentSent => "BUYER_CONFIRMED_IN_UI_PAYMENT_SENT",
            BuyerSentPaymentSentMsg => "BUYER_SENT_PAYMENT_SENT_MSG",
            BuyerSendFailedPaymentSentMsg => "BUYER_SEND_FAILED_PAYMENT_SENT_MSG",
            BuyerStoredInMailboxPaymentSentMsg => "BUYER_STORED_IN_MAILBOX_PAYMENT_SENT_MSG",
            BuyerSawArrivedPaymentSentMsg => "BUYER_SAW_ARRIVED_PAYMENT_SENT_MSG",
            SellerReceivedPaymentSentMsg => "SELLER_RECEIVED_PAYMENT_SENT_MSG",
            SellerConfirmedInUiPaymentReceipt => "SELLER_CONFIRMED_IN_UI_PAYMENT_RECEIPT",
            SellerSentPaymentReceivedMsg => "SELLER_SENT_PAYMENT_RECEIVED_MSG",
            SellerSendFailedPaymentReceivedMsg => "SELLER_SEND_FAILED_PAYMENT_RECEIVED_MSG",
            SellerStoredInMailboxPaymentReceivedMsg => {
                "SELLER_STORED_IN_MAILBOX_PAYMENT_RECEIVED_MSG"
            }
            SellerSawArrivedPaymentReceivedMsg => "SELLER_SAW_ARRIVED_PAYMENT_RECEIVED_MSG",
            BuyerReceivedPaymentReceivedMsg => "BUYER_RECEIVED_PAYMENT_RECEIVED_MSG",
            PayoutPublished => "PAYOUT_PUBLISHED",
            TradeCompleted => "TRADE_COMPLETED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Dispute tracks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeState {
    NoDispute,
    DisputeRequested,
    DisputeOpened,
    ArbitratorSentDisputeClosedMsg,
    ArbitratorSendFailedDisputeClosedMsg,
    ArbitratorStoredInMailboxDisputeClosedMsg,
    ArbitratorSawArrivedDisputeClosedMsg,
    DisputeClosed,
    MediationRequested,
    MediationStartedByPeer,
    MediationClosed,
    RefundRequested,
    RefundRequestStartedByPeer,
    RefundRequestClosed,
}

impl DisputeState {
    pub fn as_str(&self) -> &'static str {
        use DisputeState::*;
        match self {
            NoDispute => "NO_DISPUTE",
            DisputeRequested => "DISPUTE_REQUESTED",
            DisputeOpened => "DISPUTE_OPENED",
            ArbitratorSentDisputeClosedMsg => "ARBITRATOR_SENT_DISPUTE_CLOSED_MSG",
            ArbitratorSendFailedDisputeClosedMsg => "ARBITRATOR_SEND_FAILED_DISPUTE_CLOSED_MSG",
            ArbitratorStoredInMailboxDisputeClosedMsg => {
                "ARBITRATOR_STORED_IN_MAILBOX_DISPUTE_CLOSED_MSG"
            }
            ArbitratorSawArrivedDisputeClosedMsg => "ARBITRATOR_SAW_ARRIVED_DISPUTE_CLOSED_MSG",
            DisputeClosed => "DISPUTE_CLOSED",
            MediationRequested => "MEDIATION_REQUESTED",
            MediationStartedByPeer => "MEDIATION_STARTED_BY_PEER",
            MediationClosed => "MEDIATION_CLOSED",
            RefundRequested => "REFUND_REQUESTED",
            RefundRequestStartedByPeer => "REFUND_REQUEST_STARTED_BY_PEER",
            RefundRequestClosed => "REFUND_REQUEST_CLOSED",
        }
    }

    pub fn is_mediation(&self) -> bool {
        matches!(
            self,
            DisputeState::MediationRequested
                | DisputeState::MediationStartedByPeer
                | DisputeState::MediationClosed
        )
    }

    pub fn is_refund(&self) -> bool {
        matches!(
            self,
            DisputeState::RefundRequested
                | DisputeState::RefundRequestStartedByPeer
                | DisputeState::RefundRequestClosed
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            DisputeState::DisputeClosed
                | DisputeState::MediationClosed
                | DisputeState::RefundRequestClosed
        )
    }

    /// Whether the trade is in any open or closed dispute
    pub fn is_disputed(&self) -> bool {
        *self != DisputeState::NoDispute
    }
}

impl fmt::Display for DisputeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a mediated payout proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediationResultState {
    Undefined,
    MediationResultAccepted,
    MediationResultRejected,
    SigMsgSent,
    SigMsgArrived,
    SigMsgInMailbox,
    SigMsgSendFailed,
    ReceivedSigMsg,
    PayoutTxPublished,
}

impl MediationResultState {
    pub fn as_str(&self) -> &'static str {
        use MediationResultState::*;
        match self {
            Undefined => "UNDEFINED_MEDIATION_RESULT",
            MediationResultAccepted => "MEDIATION_RESULT_ACCEPTED",
            MediationResultRejected => "MEDIATION_RESULT_REJECTED",
            SigMsgSent => "SIG_MSG_SENT",
            SigMsgArrived => "SIG_MSG_ARRIVED",
            SigMsgInMailbox => "SIG_MSG_IN_MAILBOX",
            SigMsgSendFailed => "SIG_MSG_SEND_FAILED",
            ReceivedSigMsg => "RECEIVED_SIG_MSG",
            PayoutTxPublished => "PAYOUT_TX_PUBLISHED",
        }
    }

    /// Whether this node has accepted the current proposal
    pub fn has_accepted(&self) -> bool {
        use MediationResultState::*;
        matches!(
            self,
            MediationResultAccepted | SigMsgSent | SigMsgArrived | SigMsgInMailbox | SigMsgSendFailed
        )
    }
}

impl fmt::Display for MediationResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutState {
    PayoutUnpublished,
    PayoutPublished,
    PayoutConfirmed,
}

impl PayoutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutState::PayoutUnpublished => "PAYOUT_UNPUBLISHED",
            PayoutState::PayoutPublished => "PAYOUT_PUBLISHED",
            PayoutState::PayoutConfirmed => "PAYOUT_CONFIRMED",
        }
    }
}

impl fmt::Display for PayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
