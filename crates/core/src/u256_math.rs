//! U256 helpers for protocol amounts.
//!
//! Position prices are quoted so that `collateral * price / 1e18` yields a
//! stablecoin amount in 18 decimals, whatever the collateral's own decimals.

use alloy::primitives::U256;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Parts-per-million denominator
pub const PPM: u64 = 1_000_000;

/// 10^exp
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Stablecoin value of `amount` collateral at a position `price`.
///
/// Saturates instead of overflowing.
#[inline(always)]
pub fn collateral_value(amount: U256, price: U256) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    amount.saturating_mul(price) / WAD
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display and aggregates, not for status decisions.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    token_to_f64(wad, 18)
}

/// Convert a token amount with `decimals` to f64.
pub fn token_to_f64(amount: U256, decimals: u8) -> f64 {
    let scale = pow10(decimals);
    let whole = amount / scale;
    let frac = amount % scale;
    u256_to_f64(whole) + u256_to_f64(frac) / u256_to_f64(scale)
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// Parse a decimal or `0x` string into U256.
pub fn parse_u256(s: &str) -> Option<U256> {
    s.parse::<U256>().ok()
}
