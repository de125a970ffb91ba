//! Exact conversion between smallest-unit integers and decimal strings.

use ethers::types::U256;

use crate::{
    constants::MAX_TOKEN_DECIMALS,
    error::{AppError, Result},
};

/// Formats a raw on-chain amount as a decimal string.
///
/// Trailing fractional zeros are trimmed and integral values carry no
/// decimal point, so `2500000000000000000` at 18 decimals becomes `"2.5"`.
pub fn to_human_amount(raw: U256, decimals: u8) -> String {
    if decimals == 0 {
        return raw.to_string();
    }
    let decimals = decimals.min(MAX_TOKEN_DECIMALS) as usize;
    let (whole, fraction) = raw.div_mod(U256::exp10(decimals));
    if fraction.is_zero() {
        return whole.to_string();
    }

    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals);
    format!("{}.{}", whole, padded.trim_end_matches('0'))
}

/// Parses a decimal string back into its smallest-unit integer.
///
/// Rejects more fractional digits than `decimals` allows rather than rounding.
pub fn parse_human_amount(text: &str, decimals: u8) -> Result<U256> {
    let trimmed = text.trim();
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(AppError::BadRequest(format!(
            "Unsupported decimals: {}",
            decimals
        )));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    let well_formed = !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && fraction.chars().all(|c| c.is_ascii_digit());
    if !well_formed {
        return Err(AppError::BadRequest(format!("Invalid amount: {}", text)));
    }
    if fraction.len() > decimals as usize {
        return Err(AppError::BadRequest(format!(
            "Amount {} has more than {} fractional digits",
            text, decimals
        )));
    }

    let digits = format!("{}{:0<width$}", whole, fraction, width = decimals as usize);
    U256::from_dec_str(&digits)
        .map_err(|e| AppError::BadRequest(format!("Amount {} out of range: {:?}", text, e)))
}

/// Serializes a `U256` as a base-10 string instead of ethers' 0x-hex default.
pub mod u256_decimal {
    use ethers::types::U256;
    use serde::Serializer;

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(value)
    }
}
