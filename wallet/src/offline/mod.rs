//! Offline wallet and chain
//!
//! Deterministic stand-ins for wallet RPC and the daemon. Multisig blobs,
//! signatures and transactions are simulated: the shapes and ordering rules
//! of the real flow are enforced (stage order, 2-of-3 signing, relay
//! atomicity, double-spend rejection), the cryptography is not.

mod chain;
mod tx;
mod wallet;

pub use chain::OfflineChain;
pub use tx::{SimulatedTx, TxKind, TxOutput};
pub use wallet::OfflineWallet;
