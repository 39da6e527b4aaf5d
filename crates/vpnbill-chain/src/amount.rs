//! nanoTON helpers

use crate::error::{ChainError, ChainResult};

/// nanoTON per TON
pub const NANO_PER_TON: i64 = 1_000_000_000;

/// Format nanoTON as a decimal TON string with 9 fractional digits
pub fn format_ton(nano: i64) -> String {
    let sign = if nano < 0 { "-" } else { "" };
    let abs = nano.unsigned_abs();
    let per = NANO_PER_TON as u64;
    format!("{}{}.{:09}", sign, abs / per, abs % per)
}

/// Parse a decimal TON string ("1", "0.5", "1.000000500") into nanoTON
pub fn ton_to_nano(ton: &str) -> ChainResult<i64> {
    let ton = ton.trim();
    let invalid = || ChainError::InvalidAmount(ton.to_string());

    let (whole, frac) = match ton.split_once('.') {
        Some((w, f)) => (w, f),
        None => (ton, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    if whole < 0 {
        return Err(invalid());
    }
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", frac).parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(NANO_PER_TON)
        .and_then(|n| n.checked_add(frac))
        .ok_or_else(invalid)
}

/// Convert a Stars amount into nanoTON at `stars_per_ton`
pub fn stars_to_nano(stars: i64, stars_per_ton: i64) -> i64 {
    if stars_per_ton <= 0 {
        return 0;
    }
    ((stars as i128 * NANO_PER_TON as i128) / stars_per_ton as i128) as i64
}

/// Convert nanoTON to TON as a float (display only)
pub fn nano_to_ton(nano: i64) -> f64 {
    nano as f64 / NANO_PER_TON as f64
}
