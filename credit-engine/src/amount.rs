//! Fixed-point money amount
//!
//! Every balance in the engine is an [`Amount`]: a `Decimal` held at two
//! fractional digits. Arithmetic is checked; nothing silently saturates.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits kept on every amount
pub const SCALE: u32 = 2;

/// Money amount (exact decimal, two fractional digits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    /// Zero amount
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Create from a decimal, rounding half away from zero to two digits
    pub fn new(value: Decimal) -> Self {
        let mut value = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
        value.rescale(SCALE);
        Self(value)
    }

    /// Create from minor units (cents)
    pub fn from_minor(minor: i64) -> Self {
        Self(Decimal::new(minor, SCALE))
    }

    /// Whole units
    pub fn from_units(units: i64) -> Self {
        Self::new(Decimal::from(units))
    }

    /// Underlying decimal
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Checked addition
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount::new)
    }

    /// Checked subtraction (may go negative; callers decide whether that is legal)
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount::new)
    }

    /// Checked multiplication by a unit count
    pub fn checked_mul(self, count: u64) -> Option<Amount> {
        self.0.checked_mul(Decimal::from(count)).map(Amount::new)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount::new(value)
    }
}

impl FromStr for Amount {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Decimal::from_str(s)
            .map(Amount::new)
            .map_err(|e| crate::Error::Validation(format!("Invalid amount '{}': {}", s, e)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount::new(iter.map(|a| a.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_to_two_digits() {
        let amount = Amount::new(Decimal::new(12345, 3)); // 12.345
        assert_eq!(amount, Amount::from_minor(1235));
        assert_eq!(amount.to_string(), "12.35");
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Amount::from_units(4000);
        let b = Amount::from_units(3000);
        assert_eq!(a.checked_sub(b), Some(Amount::from_units(1000)));
        assert!(b.checked_sub(a).unwrap().is_negative());
        assert_eq!(Amount::from_units(1500).checked_mul(2), Some(b));
    }

    #[test]
    fn test_parse() {
        assert_eq!("50.5".parse::<Amount>().unwrap(), Amount::from_minor(5050));
        assert!("fifty".parse::<Amount>().is_err());
    }

    #[test]
    fn test_sum() {
        let total: Amount = vec![Amount::from_minor(10), Amount::from_minor(15)]
            .into_iter()
            .sum();
        assert_eq!(total, Amount::from_minor(25));
    }

    #[test]
    fn test_bincode_roundtrip_keeps_scale() {
        let amount = Amount::from_minor(500000);
        let bytes = bincode::serialize(&amount).unwrap();
        let back: Amount = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.to_string(), "5000.00");
    }
}
