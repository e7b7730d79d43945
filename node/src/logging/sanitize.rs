//! Log sanitization
//!
//! Full identifiers allow correlating a trade across nodes' logs. Only
//! prefixes and suffixes are logged.

use escrow_types::ATOMIC_UNITS_PER_COIN;

// Peers choose these strings; cut on char boundaries, never byte offsets

fn head(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

fn tail(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    match s.char_indices().nth(count.saturating_sub(n)) {
        Some((start, _)) => &s[start..],
        None => "",
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

// ============================================================================
// Identifier Sanitization
// ============================================================================

/// Format: "abc12345...90ef" (first 8 + last 4 chars)
pub fn sanitize_trade_id(id: &str) -> String {
    if char_len(id) < 12 {
        return "[invalid_trade_id]".to_string();
    }
    format!("{}...{}", head(id, 8), tail(id, 4))
}

pub fn sanitize_uid(uid: &str) -> String {
    if char_len(uid) < 12 {
        return "[invalid_uid]".to_string();
    }
    format!("{}...", head(uid, 8))
}

/// Format: "8a...XYZ" (2 first + 3 last chars)
///
/// The first char distinguishes primary (8) from multisig (4) addresses.
pub fn sanitize_address(address: &str) -> String {
    if char_len(address) < 6 {
        return "<invalid-address>".to_string();
    }
    format!("{}...{}", head(address, 2), tail(address, 3))
}

/// Rounded to 2 decimals so exact amounts cannot be matched on-chain
pub fn sanitize_amount(atomic: u64) -> String {
    let coins = atomic as f64 / ATOMIC_UNITS_PER_COIN as f64;
    format!("~{:.2}", coins)
}

// ============================================================================
// Transaction Sanitization
// ============================================================================

/// Format: "abc12345...90ef" (first 8 + last 4 chars)
pub fn sanitize_txid(txid: &str) -> String {
    if char_len(txid) < 16 {
        return "[invalid_txid]".to_string();
    }
    format!("{}...{}", head(txid, 8), tail(txid, 4))
}

pub fn sanitize_broadcast_txid(txid: &str, confirmations: Option<u64>) -> String {
    let base = sanitize_txid(txid);
    match confirmations {
        Some(n) => format!("{} ({} conf)", base, n),
        None => format!("{} (unconfirmed)", base),
    }
}

// ============================================================================
// Cryptographic Data Sanitization
// ============================================================================

/// Multisig blobs carry wallet key material: only the length is logged
pub fn sanitize_multisig_info(info: &str) -> String {
    format!("[multisig_info: {} bytes]", info.len())
}

pub fn sanitize_hex_data(data: &str, label: &str) -> String {
    if char_len(data) < 8 {
        return format!("[{}:invalid]", label);
    }
    format!("[{}:{}...{}]", label, head(data, 4), tail(data, 4))
}

pub fn trade_log_context(trade_id: &str, operation: &str) -> String {
    format!("[trade:{}] {}", sanitize_trade_id(trade_id), operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_trade_id() {
        let id = "abc12345-6789-0123-4567-890ef1234567";
        let sanitized = sanitize_trade_id(id);
        assert_eq!(sanitized, "abc12345...4567");
        assert!(!sanitized.contains("6789"));
        assert_eq!(sanitize_trade_id("abc"), "[invalid_trade_id]");
    }

    #[test]
    fn test_sanitize_address() {
        let addr = "4wHq7XM8ZtKpVqnEQB8XABCXYZ";
        assert_eq!(sanitize_address(addr), "4w...XYZ");
        assert_eq!(sanitize_address("abc"), "<invalid-address>");
    }

    #[test]
    fn test_sanitize_amount() {
        assert_eq!(sanitize_amount(1_234_567_890_123), "~1.23");
    }

    #[test]
    fn test_sanitize_txid() {
        let txid = "abc123def456789012345678901234567890123456789012345678901234wxyz";
        assert_eq!(sanitize_txid(txid), "abc123de...wxyz");
        assert_eq!(sanitize_txid("abc"), "[invalid_txid]");
        assert_eq!(
            sanitize_broadcast_txid(txid, Some(3)),
            "abc123de...wxyz (3 conf)"
        );
    }

    #[test]
    fn test_sanitize_multisig_info() {
        let info = "7072657061726564".repeat(10);
        let sanitized = sanitize_multisig_info(&info);
        assert_eq!(sanitized, "[multisig_info: 160 bytes]");
    }

    #[test]
    fn test_multibyte_input_is_cut_on_char_boundaries() {
        assert_eq!(sanitize_trade_id("ééééééééééééé"), "éééééééé...éééé");
        assert_eq!(sanitize_uid("üid-ñññññññññ"), "üid-ññññ...");
        assert_eq!(sanitize_address("4€€€€€€xyz"), "4€...xyz");
        assert_eq!(sanitize_txid("ab\u{1F600}defghijklmnopq"), "ab\u{1F600}defgh...nopq");
        assert_eq!(sanitize_hex_data("ßßßß1234", "sig"), "[sig:ßßßß...1234]");
        // Short by chars even when long in bytes
        assert_eq!(sanitize_trade_id("éééééé"), "[invalid_trade_id]");
    }

    #[test]
    fn test_log_context() {
        let ctx = trade_log_context("abc12345-6789-0123-4567-890ef1234567", "deposits published");
        assert!(ctx.contains("[trade:abc12345...4567]"));
        assert_eq!(sanitize_hex_data("abcdef1234567890", "sig"), "[sig:abcd...7890]");
    }
}
