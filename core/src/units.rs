//! Base-unit amounts.
//!
//! All arithmetic and comparison happens on [`Wei`]. Decimal strings only exist at
//! the display and input edges, through [`parse_units`] and [`format_units`].

use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Decimal places of the native currency.
pub const ETHER_DECIMALS: u32 = 18;

/// Errors converting between decimal strings and base units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    /// The string was empty or not a decimal number
    #[error("invalid amount '{0}'")]
    Invalid(String),

    /// More fractional digits than the unit supports
    #[error("amount '{input}' has more than {decimals} decimal places")]
    TooPrecise {
        /// Original input
        input: String,
        /// Supported decimal places
        decimals: u32,
    },

    /// The amount does not fit in 256 bits
    #[error("amount '{0}' overflows")]
    Overflow(String),
}

/// An amount of the native currency in base units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Wei(pub U256);

impl Wei {
    /// Zero.
    pub const ZERO: Self = Self(U256::zero());

    /// Whether the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parse a decimal ether amount, e.g. `"0.05"`.
    ///
    /// # Errors
    ///
    /// See [`parse_units`].
    pub fn from_ether(amount: &str) -> Result<Self, UnitsError> {
        parse_units(amount, ETHER_DECIMALS)
    }

    /// Render as a decimal ether amount.
    #[must_use]
    pub fn to_ether(&self) -> String {
        format_units(*self, ETHER_DECIMALS)
    }

    /// `self * percent / 100`, rounded down.
    #[must_use]
    pub fn percent(&self, percent: u8) -> Self {
        Self(self.0 * U256::from(percent) / U256::from(100u8))
    }

    /// Subtraction that stops at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for Wei {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for Wei {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl Add for Wei {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Wei {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Wei {
    type Err = UnitsError;

    /// Parse a base-unit integer string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_units(s, 0)
    }
}

// Decimal strings keep full 256-bit precision through JSON.
impl Serialize for Wei {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Wei {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Convert a decimal string to base units with `decimals` fractional places.
///
/// # Errors
///
/// Returns [`UnitsError`] if the input is not a non-negative decimal number, has
/// more fractional digits than `decimals`, or does not fit in 256 bits.
///
/// # Examples
///
/// ```
/// use ticketchain_core::{parse_units, Wei};
///
/// assert_eq!(parse_units("1.5", 18).unwrap(), Wei::from(1_500_000_000_000_000_000u64));
/// ```
pub fn parse_units(amount: &str, decimals: u32) -> Result<Wei, UnitsError> {
    let trimmed = amount.trim();
    let invalid = || UnitsError::Invalid(amount.to_string());

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let fraction = fraction.trim_end_matches('0');
    let decimals_usize = usize::try_from(decimals).map_err(|_| invalid())?;
    if fraction.len() > decimals_usize {
        return Err(UnitsError::TooPrecise {
            input: amount.to_string(),
            decimals,
        });
    }

    let mut digits = String::with_capacity(whole.len() + decimals_usize);
    digits.push_str(whole);
    digits.push_str(fraction);
    digits.extend(std::iter::repeat_n('0', decimals_usize - fraction.len()));
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(Wei::ZERO);
    }

    U256::from_dec_str(digits)
        .map(Wei)
        .map_err(|_| UnitsError::Overflow(amount.to_string()))
}

/// Render base units as a decimal string with `decimals` fractional places.
///
/// Trailing fractional zeros are dropped; whole amounts render without a point.
///
/// ```
/// use ticketchain_core::{format_units, Wei};
///
/// assert_eq!(format_units(Wei::from(50_000_000_000_000_000u64), 18), "0.05");
/// assert_eq!(format_units(Wei::from(2_000_000_000_000_000_000u64), 18), "2");
/// ```
#[must_use]
pub fn format_units(amount: Wei, decimals: u32) -> String {
    let raw = amount.0.to_string();
    let Ok(decimals) = usize::try_from(decimals) else {
        return raw;
    };
    if decimals == 0 {
        return raw;
    }

    let padded = if raw.len() <= decimals {
        format!("{}{raw}", "0".repeat(decimals - raw.len() + 1))
    } else {
        raw
    };
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_common_ether_amounts() {
        assert_eq!(Wei::from_ether("0.05").unwrap(), Wei::from(50_000_000_000_000_000u64));
        assert_eq!(Wei::from_ether("1").unwrap(), Wei::from(1_000_000_000_000_000_000u64));
        assert_eq!(Wei::from_ether(".5").unwrap(), Wei::from(500_000_000_000_000_000u64));
        assert_eq!(Wei::from_ether("0").unwrap(), Wei::ZERO);
        assert_eq!(Wei::from_ether("1.000").unwrap(), Wei::from(1_000_000_000_000_000_000u64));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(Wei::from_ether(""), Err(UnitsError::Invalid(_))));
        assert!(matches!(Wei::from_ether("."), Err(UnitsError::Invalid(_))));
        assert!(matches!(Wei::from_ether("-1"), Err(UnitsError::Invalid(_))));
        assert!(matches!(Wei::from_ether("1e18"), Err(UnitsError::Invalid(_))));
        assert!(matches!(
            Wei::from_ether("0.0000000000000000001"),
            Err(UnitsError::TooPrecise { decimals: 18, .. })
        ));
    }

    #[test]
    fn formats_small_and_whole_amounts() {
        assert_eq!(format_units(Wei::from(1u64), 18), "0.000000000000000001");
        assert_eq!(format_units(Wei::ZERO, 18), "0");
        assert_eq!(format_units(Wei::from(12_345u64), 2), "123.45");
        assert_eq!(format_units(Wei::from(7u64), 0), "7");
    }

    #[test]
    fn percent_rounds_down() {
        assert_eq!(Wei::from(1_000u64).percent(10), Wei::from(100u64));
        assert_eq!(Wei::from(99u64).percent(10), Wei::from(9u64));
        assert_eq!(Wei::from(99u64).percent(0), Wei::ZERO);
    }

    #[test]
    fn serde_uses_decimal_string() {
        let w = Wei::from(123u64);
        assert_eq!(serde_json::to_string(&w).unwrap(), "\"123\"");
        assert_eq!(serde_json::from_str::<Wei>("\"123\"").unwrap(), w);
    }

    proptest! {
        #[test]
        fn format_then_parse_is_identity(raw in any::<u128>(), decimals in 0u32..=18) {
            let amount = Wei(U256::from(raw));
            let rendered = format_units(amount, decimals);
            prop_assert_eq!(parse_units(&rendered, decimals).unwrap(), amount);
        }

        #[test]
        fn ordering_matches_base_units(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Wei::from(a) <= Wei::from(b), a <= b);
        }
    }
}
