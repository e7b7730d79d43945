//! Offline end-to-end tests for the escrow trade protocol
//!
//! Three nodes (maker, taker, arbitrator) trade over the in-process network
//! and the offline chain. No daemon, no network, no disk.
//!
//! ## Test Categories
//! - **Trade flow**: happy path, deposit relay atomicity, lost ACKs,
//!   mailbox ordering, multisig delivery, offer availability and
//!   reservation, protocol timeouts
//! - **Disputes**: mediation rejected and escalated to the refund agent,
//!   trader chat
//!
//! ## Running Tests
//! ```bash
//! cargo test --package escrow-node --test offline_e2e
//!
//! # With logs
//! RUST_LOG=escrow_node=debug cargo test --package escrow-node --test offline_e2e -- --nocapture
//! ```

pub mod dispute_tests;
pub mod mock_infrastructure;
pub mod trade_flow_tests;

pub use mock_infrastructure::*;
