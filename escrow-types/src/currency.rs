//! Counter-currency helpers and atomic unit conversion

/// 1 coin = 10^12 atomic units
pub const ATOMIC_UNITS_PER_COIN: u64 = 1_000_000_000_000;

/// Counter currencies settled on-chain rather than through a bank rail
const CRYPTO_CURRENCY_CODES: &[&str] = &["BTC", "BCH", "LTC", "ETH", "DAI", "USDT", "USDC"];

/// Whether the counter currency of a trade is itself a cryptocurrency.
///
/// Crypto counter payments are not reversible, so sellers may confirm receipt
/// even while a dispute is open.
pub fn is_crypto_currency(code: &str) -> bool {
    let upper = code.to_uppercase();
    CRYPTO_CURRENCY_CODES.iter().any(|c| *c == upper)
}

/// Convert whole coins to atomic units (rounded down)
pub fn coins_to_atomic(coins: f64) -> u64 {
    (coins * ATOMIC_UNITS_PER_COIN as f64).floor() as u64
}

/// Format atomic units as a coin amount with 12 decimals
pub fn format_atomic(amount: u64) -> String {
    format!(
        "{}.{:012}",
        amount / ATOMIC_UNITS_PER_COIN,
        amount % ATOMIC_UNITS_PER_COIN
    )
}
