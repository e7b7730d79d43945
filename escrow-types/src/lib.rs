//! Escrow Shared Types
//!
//! Types shared by every party of a 2-of-3 escrow trade:
//! - Node addresses and key rings used to authenticate protocol messages
//! - Offers and the contract both traders sign
//! - Payment account payloads and their sealed (encrypted) form
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  escrow-types (this crate)                                      │
//! │  ├─ Shared between trade nodes and the wallet layer             │
//! │  ├─ Serde serialization for message transport and persistence   │
//! │  └─ ed25519 signatures over contracts and dispute results       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod contract;
pub mod currency;
pub mod keys;
pub mod offer;
pub mod payment_account;

pub use contract::*;
pub use currency::*;
pub use keys::*;
pub use offer::*;
pub use payment_account::*;
