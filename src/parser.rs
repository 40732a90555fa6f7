// src/parser.rs
use std::str::FromStr;

use alloy::primitives::Address;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// 10^18, one whole token in base units
pub const TOKEN_UNIT: u128 = 1_000_000_000_000_000_000;

/// Parse a 20-byte hex address; case is ignored.
pub fn parse_address(raw: &str) -> Option<Address> {
    let s = raw.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let bytes = hex::decode(digits).ok()?;
    let addr_bytes: [u8; 20] = bytes.as_slice().try_into().ok()?;
    Some(Address::from(addr_bytes))
}

/// Lowercase `0x` form used for storage and the API
pub fn address_hex(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// Parse a stored fixed-point amount (plain decimal integer)
pub fn parse_amount(raw: &str) -> Option<u128> {
    raw.trim().parse::<u128>().ok()
}

/// Parse a caller-supplied amount threshold. Accepts plain integers and
/// scientific notation (`1e21`, `10e20`); must be a non-negative integer.
pub fn parse_threshold(raw: &str) -> Result<u128, String> {
    let s = raw.trim();
    if let Ok(v) = s.parse::<u128>() {
        return Ok(v);
    }

    let value = Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| format!("invalid threshold: {raw}"))?;

    if value.is_sign_negative() || !value.fract().is_zero() {
        return Err(format!("threshold must be a non-negative integer: {raw}"));
    }

    value
        .to_u128()
        .ok_or_else(|| format!("threshold out of range: {raw}"))
}

/// Whole tokens with thousands separators, e.g. `12,346` (rounded half up)
pub fn format_token(amount: u128) -> String {
    let whole = amount / TOKEN_UNIT + u128::from(amount % TOKEN_UNIT >= TOKEN_UNIT / 2);
    let digits = whole.to_string();

    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
