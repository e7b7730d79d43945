//! Trade fee and security deposit configuration
//!
//! Fees are expressed in basis points of the trade amount and are configurable
//! via environment variables, clamped to sane bounds.

use std::env;

/// Maker fee: 0.15%
///
/// Override via ESCROW_MAKER_FEE_BPS environment variable.
pub const DEFAULT_MAKER_FEE_BPS: u64 = 15;

/// Taker fee: 0.75%
///
/// Override via ESCROW_TAKER_FEE_BPS environment variable.
pub const DEFAULT_TAKER_FEE_BPS: u64 = 75;

/// Above this, the fee is likely a configuration error (5%)
pub const MAX_FEE_BPS: u64 = 500;

/// Security deposit as a fraction of the trade amount, floored at
/// [`escrow_types::MIN_SECURITY_DEPOSIT`]
pub const DEFAULT_SECURITY_DEPOSIT_PCT: f64 = 0.15;

pub const MIN_SECURITY_DEPOSIT_PCT: f64 = 0.0;
pub const MAX_SECURITY_DEPOSIT_PCT: f64 = 0.5;

fn get_fee_bps(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(|bps: u64| {
            if bps > MAX_FEE_BPS {
                tracing::warn!(key = key, bps = bps, max = MAX_FEE_BPS, "Fee above maximum, using maximum");
                MAX_FEE_BPS
            } else {
                bps
            }
        })
        .unwrap_or(default)
}

pub fn get_maker_fee_bps() -> u64 {
    get_fee_bps("ESCROW_MAKER_FEE_BPS", DEFAULT_MAKER_FEE_BPS)
}

pub fn get_taker_fee_bps() -> u64 {
    get_fee_bps("ESCROW_TAKER_FEE_BPS", DEFAULT_TAKER_FEE_BPS)
}

/// Reads ESCROW_SECURITY_DEPOSIT_PCT, clamped to [0, 0.5]
pub fn get_security_deposit_pct() -> f64 {
    env::var("ESCROW_SECURITY_DEPOSIT_PCT")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|pct| pct.is_finite())
        .map(|pct| pct.clamp(MIN_SECURITY_DEPOSIT_PCT, MAX_SECURITY_DEPOSIT_PCT))
        .unwrap_or(DEFAULT_SECURITY_DEPOSIT_PCT)
}

fn apply_bps(amount: u64, bps: u64) -> u64 {
    ((amount as u128 * bps as u128) / 10_000) as u64
}

pub fn maker_fee(trade_amount: u64) -> u64 {
    apply_bps(trade_amount, get_maker_fee_bps())
}

pub fn taker_fee(trade_amount: u64) -> u64 {
    apply_bps(trade_amount, get_taker_fee_bps())
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_types::ATOMIC_UNITS_PER_COIN;

    #[test]
    fn test_default_fee_values() {
        assert_eq!(apply_bps(ATOMIC_UNITS_PER_COIN, DEFAULT_MAKER_FEE_BPS), 1_500_000_000);
        assert_eq!(apply_bps(ATOMIC_UNITS_PER_COIN, DEFAULT_TAKER_FEE_BPS), 7_500_000_000);
    }

    #[test]
    fn test_fee_bounds() {
        assert!(DEFAULT_MAKER_FEE_BPS < DEFAULT_TAKER_FEE_BPS);
        assert!(DEFAULT_TAKER_FEE_BPS < MAX_FEE_BPS);
        assert!(DEFAULT_SECURITY_DEPOSIT_PCT <= MAX_SECURITY_DEPOSIT_PCT);
    }

    #[test]
    fn test_apply_bps_no_overflow() {
        assert_eq!(apply_bps(u64::MAX, 10_000), u64::MAX);
    }
}
