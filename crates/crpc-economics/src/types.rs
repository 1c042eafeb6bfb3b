use serde::{Deserialize, Serialize};
use std::fmt;

pub const TOKEN_DECIMALS: u32 = 9;
pub const TOKEN_BASE_UNIT: u64 = 1_000_000_000; // 10^9

/// Denominator for all percentage parameters (10_000 bps = 100%).
pub const BASIS_POINTS: u64 = 10_000;

/// Fungible token amount in base units.
///
/// All protocol arithmetic is integer; there is no floating-point path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenAmount(u64);

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    pub fn from_tokens(tokens: u64) -> Self {
        Self(tokens.saturating_mul(TOKEN_BASE_UNIT))
    }

    pub fn from_base_units(units: u64) -> Self {
        Self(units)
    }

    pub fn to_base_units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// `self * bps / 10_000`, rounded down.
    pub fn mul_bps(&self, bps: u16) -> Self {
        let scaled = (self.0 as u128 * bps as u128) / BASIS_POINTS as u128;
        Self(scaled as u64)
    }

    /// `self * numerator / denominator`, rounded down. Zero when `denominator` is zero.
    pub fn mul_ratio(&self, numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Self::ZERO;
        }
        let scaled = (self.0 as u128 * numerator as u128) / denominator as u128;
        Self(scaled.min(u64::MAX as u128) as u64)
    }

    /// Split into `parts` equal shares; returns (share, remainder).
    pub fn split_even(&self, parts: u64) -> (Self, Self) {
        if parts == 0 {
            return (Self::ZERO, *self);
        }
        (Self(self.0 / parts), Self(self.0 % parts))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09} CRPC",
            self.0 / TOKEN_BASE_UNIT,
            self.0 % TOKEN_BASE_UNIT
        )
    }
}

impl std::iter::Sum for TokenAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc.saturating_add(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_fixed_decimals() {
        let amount = TokenAmount::from_base_units(1_500_000_000);
        assert_eq!(amount.to_string(), "1.500000000 CRPC");
    }

    #[test]
    fn test_mul_bps_rounds_down() {
        let pool = TokenAmount::from_base_units(1_001);
        assert_eq!(pool.mul_bps(7_000), TokenAmount::from_base_units(700));
        assert_eq!(pool.mul_bps(10_000), pool);
        assert_eq!(pool.mul_bps(0), TokenAmount::ZERO);
    }

    #[test]
    fn test_mul_bps_no_overflow_at_max() {
        let max = TokenAmount::from_base_units(u64::MAX);
        assert_eq!(max.mul_bps(10_000), max);
    }

    #[test]
    fn test_split_even_keeps_remainder() {
        let (share, rest) = TokenAmount::from_base_units(100).split_even(3);
        assert_eq!(share, TokenAmount::from_base_units(33));
        assert_eq!(rest, TokenAmount::from_base_units(1));

        let (share, rest) = TokenAmount::from_base_units(100).split_even(0);
        assert_eq!(share, TokenAmount::ZERO);
        assert_eq!(rest, TokenAmount::from_base_units(100));
    }

    #[test]
    fn test_mul_ratio() {
        let amount = TokenAmount::from_base_units(90);
        assert_eq!(amount.mul_ratio(1, 3), TokenAmount::from_base_units(30));
        assert_eq!(amount.mul_ratio(5, 0), TokenAmount::ZERO);
    }
}
