//! Hex quantities and denominations.
//!
//! Quantities on the wire are `0x`-prefixed hex. Quai amounts are in wei
//! (10^18 per Quai) and Qi amounts in qits (1000 per Qi).

use ruint::aliases::U256;

/// Wei per Quai.
pub const WEI_PER_QUAI: u64 = 1_000_000_000_000_000_000;

/// Qits per Qi.
pub const QITS_PER_QI: u64 = 1000;

fn hex_digits(hex: &str) -> Option<&str> {
    let digits = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(digits)
}

/// Parse a hex quantity of up to 256 bits, `0x` prefix optional.
pub fn parse_hex_quantity(hex: &str) -> Option<U256> {
    U256::from_str_radix(hex_digits(hex)?, 16).ok()
}

/// Parse a hex quantity that fits in 64 bits, such as a block number.
pub fn parse_hex_u64(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex_digits(hex)?, 16).ok()
}

/// Encode as a `0x`-prefixed hex quantity.
pub fn to_hex(value: u64) -> String {
    format!("{value:#x}")
}

fn pow10(exp: u32) -> U256 {
    let ten = U256::from(10u64);
    (0..exp).fold(U256::from(1u64), |acc, _| acc * ten)
}

/// Render a wei amount as Quai with at most `decimals` fractional digits,
/// truncated, trailing zeros trimmed.
pub fn format_wei(amount: U256, decimals: u32) -> String {
    let wei = U256::from(WEI_PER_QUAI);
    let whole = amount / wei;
    let fraction = (amount % wei) * pow10(decimals) / wei;

    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    let trimmed = padded.trim_end_matches('0');
    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{trimmed}")
    }
}

/// Display precision for an exchange-rate quote: sub-Quai amounts get more
/// digits.
pub fn quote_decimals(amount: U256) -> u32 {
    if amount < U256::from(WEI_PER_QUAI) {
        8
    } else {
        6
    }
}
