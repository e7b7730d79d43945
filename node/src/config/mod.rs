//! Protocol configuration
//!
//! Values come from `Default` and may be overridden through environment
//! variables. Unparseable values are logged and ignored.

pub mod fee;

use escrow_wallet::FeePriority;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use fee::{
    get_maker_fee_bps, get_security_deposit_pct, get_taker_fee_bps, maker_fee, taker_fee,
    DEFAULT_MAKER_FEE_BPS, DEFAULT_SECURITY_DEPOSIT_PCT, DEFAULT_TAKER_FEE_BPS,
};

/// Timing and confirmation settings shared by every trade on a node
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Window for a protocol step, and for the trade to publish its deposits
    pub trade_timeout: Duration,

    /// Delay before a message that arrived too early is applied again
    pub retry_delay: Duration,

    /// Quiet period before a persistence request is written
    pub persistence_debounce: Duration,

    /// Confirmations before deposits count as confirmed
    pub confirmations_for_confirmed: u64,

    /// Confirmations before deposits are spendable
    pub confirmations_for_unlocked: u64,

    /// Payout confirmations before the trade completes
    pub payout_confirmations_for_completed: u64,

    /// How often the trade manager polls the daemon
    pub poll_interval: Duration,

    /// Where the trade list is stored
    pub data_dir: PathBuf,

    /// Miner fee level for deposit and payout transactions
    pub fee_priority: FeePriority,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            trade_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(2),
            persistence_debounce: Duration::from_millis(200),
            confirmations_for_confirmed: 1,
            confirmations_for_unlocked: 10,
            payout_confirmations_for_completed: 1,
            poll_interval: Duration::from_secs(5),
            data_dir: PathBuf::from("./escrow-data"),
            fee_priority: FeePriority::Normal,
        }
    }
}

impl ProtocolConfig {
    /// Create configuration from environment variables
    ///
    /// # Environment Variables
    /// - `ESCROW_TRADE_TIMEOUT_SECS` (default: 60)
    /// - `ESCROW_RETRY_DELAY_MS` (default: 2000)
    /// - `ESCROW_PERSISTENCE_DEBOUNCE_MS` (default: 200)
    /// - `ESCROW_CONFIRMATIONS_CONFIRMED` (default: 1)
    /// - `ESCROW_CONFIRMATIONS_UNLOCKED` (default: 10)
    /// - `ESCROW_PAYOUT_CONFIRMATIONS` (default: 1)
    /// - `ESCROW_POLL_INTERVAL_SECS` (default: 5)
    /// - `ESCROW_DATA_DIR` (default: ./escrow-data)
    /// - `ESCROW_FEE_PRIORITY` (default: normal; low, high and urgent also accepted)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let confirmations_for_confirmed = parse_env(
            "ESCROW_CONFIRMATIONS_CONFIRMED",
            defaults.confirmations_for_confirmed,
        );
        let mut confirmations_for_unlocked = parse_env(
            "ESCROW_CONFIRMATIONS_UNLOCKED",
            defaults.confirmations_for_unlocked,
        );
        if confirmations_for_unlocked < confirmations_for_confirmed {
            tracing::warn!(
                confirmed = confirmations_for_confirmed,
                unlocked = confirmations_for_unlocked,
                "Unlock confirmations below confirmed threshold, raising"
            );
            confirmations_for_unlocked = confirmations_for_confirmed;
        }

        Self {
            trade_timeout: Duration::from_secs(parse_env(
                "ESCROW_TRADE_TIMEOUT_SECS",
                defaults.trade_timeout.as_secs(),
            )),
            retry_delay: Duration::from_millis(parse_env(
                "ESCROW_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
            persistence_debounce: Duration::from_millis(parse_env(
                "ESCROW_PERSISTENCE_DEBOUNCE_MS",
                defaults.persistence_debounce.as_millis() as u64,
            )),
            confirmations_for_confirmed,
            confirmations_for_unlocked,
            payout_confirmations_for_completed: parse_env(
                "ESCROW_PAYOUT_CONFIRMATIONS",
                defaults.payout_confirmations_for_completed,
            ),
            poll_interval: Duration::from_secs(parse_env(
                "ESCROW_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            data_dir: env::var("ESCROW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            fee_priority: parse_env("ESCROW_FEE_PRIORITY", defaults.fee_priority),
        }
    }

    pub fn trade_list_path(&self) -> PathBuf {
        self.data_dir.join("trades.json")
    }
}

fn parse_env<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = key, value = %raw, default = %default, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
