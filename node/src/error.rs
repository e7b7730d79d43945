//! Error types for the trade protocol, delivery, persistence and support flows

use escrow_types::{KeyError, NodeAddress, PayloadError};
use escrow_wallet::{DaemonError, WalletError};
use thiserror::Error;

use crate::models::{Phase, Role, State};
use crate::protocol::messages::AvailabilityResult;

/// Errors raised while applying a protocol message or local action
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    // ------------------------------------------------------------------
    // Protocol violations: fatal to the message, never retried
    // ------------------------------------------------------------------
    #[error("Trade id mismatch: expected {expected}, got {actual}")]
    TradeIdMismatch { expected: String, actual: String },

    #[error("Unexpected sender {sender}: {reason}")]
    UnexpectedSender { sender: NodeAddress, reason: String },

    #[error("Signature verification failed: {0}")]
    SignatureMismatch(String),

    #[error("Multisig {stage} hex from {role} differs from the one on record")]
    MultisigHexMismatch { role: Role, stage: &'static str },

    #[error("Multisig address mismatch: ours {ours}, {role} declared {declared}")]
    MultisigAddressMismatch {
        role: Role,
        ours: String,
        declared: String,
    },

    #[error("Contract mismatch: {0}")]
    ContractMismatch(String),

    #[error("{0}")]
    Verification(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // ------------------------------------------------------------------
    // Preconditions: the message may simply be early
    // ------------------------------------------------------------------
    #[error("Unexpected phase {actual}, expected one of [{expected}]")]
    UnexpectedPhase { expected: String, actual: Phase },

    #[error("Unexpected state {actual}, expected one of [{expected}]")]
    UnexpectedState { expected: String, actual: State },

    // ------------------------------------------------------------------
    // Local faults
    // ------------------------------------------------------------------
    #[error("State {state} is not permitted for {variant}")]
    StateNotPermitted { state: State, variant: &'static str },

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Missing trade data: {0}")]
    MissingData(String),

    #[error("Trade not found: {0}")]
    TradeNotFound(String),

    #[error("Timeout reached. Protocol did not complete in {secs} sec.")]
    Timeout { secs: u64 },

    #[error("Offer not available: {0}")]
    OfferNotAvailable(AvailabilityResult),

    #[error("Peer rejected {message}: {reason}")]
    PeerRejected { message: String, reason: String },

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Payment account payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Early messages: retried once after the configured delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedPhase { .. } | ProtocolError::UnexpectedState { .. }
        )
    }

    /// Faults caused by a peer sending something it must not
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            ProtocolError::TradeIdMismatch { .. }
            | ProtocolError::UnexpectedSender { .. }
            | ProtocolError::SignatureMismatch(_)
            | ProtocolError::MultisigHexMismatch { .. }
            | ProtocolError::MultisigAddressMismatch { .. }
            | ProtocolError::ContractMismatch(_)
            | ProtocolError::Verification(_)
            | ProtocolError::InvalidMessage(_)
            | ProtocolError::Key(_) => true,
            ProtocolError::Wallet(e) => e.is_verification_failure(),
            _ => false,
        }
    }

    /// Message-level faults dropped with a negative ACK without touching the trade
    pub fn is_message_rejection(&self) -> bool {
        matches!(
            self,
            ProtocolError::TradeIdMismatch { .. } | ProtocolError::UnexpectedSender { .. }
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Message delivery faults
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Peer {0} is offline")]
    PeerOffline(NodeAddress),

    #[error("Peer {0} is unknown to the network")]
    UnknownPeer(NodeAddress),

    #[error("Peer key ring does not match recipient {0}")]
    KeyMismatch(NodeAddress),

    #[error("Network shut down")]
    Shutdown,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::PeerOffline(_))
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Trade store faults
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Mediation and refund faults
#[derive(Error, Debug, Clone)]
pub enum SupportError {
    #[error("No {support_type} dispute for trade {trade_id}")]
    DisputeNotFound {
        trade_id: String,
        support_type: &'static str,
    },

    #[error("A {0} dispute is already open for this trade")]
    AlreadyOpen(&'static str),

    #[error("Dispute cannot be opened: {0}")]
    NotOpenable(String),

    #[error("Only the arbitrator can act as support agent")]
    NotAgent,

    #[error("Invalid dispute result: {0}")]
    InvalidResult(String),

    #[error("Dispute result signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Mediation result already {0}")]
    MediationSettled(&'static str),

    #[error("Trade chat closed: {0}")]
    ChatClosed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<WalletError> for SupportError {
    fn from(e: WalletError) -> Self {
        SupportError::Protocol(ProtocolError::Wallet(e))
    }
}

impl From<DaemonError> for SupportError {
    fn from(e: DaemonError) -> Self {
        SupportError::Protocol(ProtocolError::Daemon(e))
    }
}

impl From<DeliveryError> for SupportError {
    fn from(e: DeliveryError) -> Self {
        SupportError::Protocol(ProtocolError::Delivery(e))
    }
}

pub type SupportResult<T> = Result<T, SupportError>;
