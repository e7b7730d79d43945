//! Trade lifecycle across three nodes

pub mod deposit_atomicity_test;
pub mod happy_path_test;
pub mod lost_ack_test;
pub mod mailbox_ordering_test;
pub mod multisig_round_test;
pub mod offer_availability_test;
pub mod offer_reservation_test;
pub mod timeout_test;
