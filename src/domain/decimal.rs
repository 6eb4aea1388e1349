//! Lossless decimal numeric type backed by rust_decimal.
//!
//! Provides canonical parsing from strings, fixed-point conversion from
//! on-chain base units, and formatting without exponent notation.

use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lossless decimal numeric type for financial calculations.
///
/// Backed by rust_decimal to avoid floating-point drift, so derived tables
/// are reproducible bit for bit. Serializes to a JSON string.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

impl Decimal {
    /// Create a Decimal from a RustDecimal.
    pub fn new(value: RustDecimal) -> Self {
        Decimal(value)
    }

    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s).map(Decimal)
    }

    /// Interpret an integer amount as fixed-point with `decimals` places.
    ///
    /// Returns None when the amount does not fit the 96-bit mantissa.
    pub fn from_base_units(amount: u128, decimals: u32) -> Option<Self> {
        let signed = i128::try_from(amount).ok()?;
        RustDecimal::try_from_i128_with_scale(signed, decimals)
            .ok()
            .map(Decimal)
    }

    /// Format the Decimal as a canonical string (no exponent notation).
    pub fn to_canonical_string(&self) -> String {
        let normalized = self.0.normalize();
        format!("{}", normalized)
    }

    /// The additive identity (0).
    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    /// The settlement value of a winning outcome token (1).
    pub fn one() -> Self {
        Decimal(RustDecimal::ONE)
    }

    /// Returns true if the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns true if the value is > 0.
    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    /// Returns true if the value is < 0.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    /// Division that returns None on a zero divisor or overflow.
    pub fn checked_div(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_div(rhs.0).map(Decimal)
    }

    /// Round to `dp` decimal places (banker's rounding).
    pub fn round_dp(&self, dp: u32) -> Decimal {
        Decimal(self.0.round_dp(dp))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl From<u64> for Decimal {
    fn from(value: u64) -> Self {
        Decimal(RustDecimal::from(value))
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul for Decimal {
    type Output = Decimal;

    fn mul(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 * rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

impl std::iter::Sum for Decimal {
    fn sum<I: Iterator<Item = Decimal>>(iter: I) -> Decimal {
        iter.fold(Decimal::zero(), |acc, d| acc + d)
    }
}
