//! Miner fee estimation
//!
//! Fees follow the per-byte model with quantization:
//! `fee = ceil(size * fee_per_byte / mask) * mask`

use serde::{Deserialize, Serialize};

/// Approximate size of a deposit tx (multisig output, trade fee output, change)
pub const DEPOSIT_TX_SIZE_BYTES: u64 = 2000;

/// Approximate size of a 2-output multisig payout
pub const PAYOUT_TX_SIZE_BYTES: u64 = 1500;

const DEFAULT_FEE_PER_BYTE: u64 = 20_000;
const DEFAULT_QUANTIZATION_MASK: u64 = 10_000;

/// Fee priority levels matching wallet priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeePriority {
    Unimportant,
    #[default]
    Normal,
    Elevated,
    Priority,
}

impl FeePriority {
    pub fn multiplier(&self) -> u64 {
        match self {
            FeePriority::Unimportant => 1,
            FeePriority::Normal => 4,
            FeePriority::Elevated => 20,
            FeePriority::Priority => 166,
        }
    }
}

impl std::fmt::Display for FeePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FeePriority::Unimportant => "unimportant",
            FeePriority::Normal => "normal",
            FeePriority::Elevated => "elevated",
            FeePriority::Priority => "priority",
        };
        f.write_str(name)
    }
}

/// Accepts the wallet names plus the low/high/urgent aliases used in config
impl std::str::FromStr for FeePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unimportant" | "low" => Ok(FeePriority::Unimportant),
            "normal" | "default" => Ok(FeePriority::Normal),
            "elevated" | "high" => Ok(FeePriority::Elevated),
            "priority" | "urgent" => Ok(FeePriority::Priority),
            _ => Err(format!("Unknown fee priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub fee_per_byte: u64,
    pub quantization_mask: u64,
    pub priority: FeePriority,
}

impl FeeEstimate {
    /// Estimate used when no daemon fee hint is available
    pub fn fallback(priority: FeePriority) -> Self {
        Self {
            fee_per_byte: DEFAULT_FEE_PER_BYTE * priority.multiplier(),
            quantization_mask: DEFAULT_QUANTIZATION_MASK,
            priority,
        }
    }

    pub fn calculate_fee(&self, tx_size_bytes: u64) -> u64 {
        quantize_fee(tx_size_bytes * self.fee_per_byte, self.quantization_mask)
    }
}

fn quantize_fee(fee: u64, mask: u64) -> u64 {
    if mask == 0 {
        return fee;
    }
    fee.div_ceil(mask) * mask
}

/// Share of a payout's miner fee borne by output `index` of `outputs`.
///
/// The fee is split evenly; output 0 absorbs the remainder.
pub fn fee_share(miner_fee: u64, outputs: usize, index: usize) -> u64 {
    if outputs == 0 {
        return 0;
    }
    let base = miner_fee / outputs as u64;
    if index == 0 {
        base + miner_fee % outputs as u64
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_quantization() {
        assert_eq!(quantize_fee(9999, 10000), 10000);
        assert_eq!(quantize_fee(10000, 10000), 10000);
        assert_eq!(quantize_fee(10001, 10000), 20000);
        assert_eq!(quantize_fee(12345, 0), 12345);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("low".parse::<FeePriority>().unwrap(), FeePriority::Unimportant);
        assert_eq!("urgent".parse::<FeePriority>().unwrap(), FeePriority::Priority);
        assert!("whenever".parse::<FeePriority>().is_err());
    }

    #[test]
    fn test_fallback_estimate_scales_with_priority() {
        let normal = FeeEstimate::fallback(FeePriority::Normal);
        let elevated = FeeEstimate::fallback(FeePriority::Elevated);
        assert!(elevated.calculate_fee(PAYOUT_TX_SIZE_BYTES) > normal.calculate_fee(PAYOUT_TX_SIZE_BYTES));
        assert_eq!(normal.calculate_fee(1500), 120_000_000);
    }

    #[test]
    fn test_fee_share_sums_to_fee() {
        let fee = 1001;
        let total: u64 = (0..3).map(|i| fee_share(fee, 3, i)).sum();
        assert_eq!(total, fee);
        assert_eq!(fee_share(fee, 3, 0), 335);
        assert_eq!(fee_share(fee, 3, 2), 333);
        assert_eq!(fee_share(fee, 0, 0), 0);
    }
}
