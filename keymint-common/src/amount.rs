//! A monetary amount newtype in integer minor units (cents).
//!
//! All money in keymint is represented as a non-negative integer number of
//! minor units; display conversions happen at the edges. We don't impl
//! `From<i64>` or `FromStr` because calling code should be explicit about
//! whether an input is in minor units or major units ("pesos").

use std::fmt::{self, Display};
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Amount is negative")]
    Negative,
    #[error("Amount is not a number")]
    NotANumber,
    #[error("Amount overflows the minor-unit representation")]
    Overflow,
}

/// A monetary amount in integer minor units (cents).
///
/// - The contained value is non-negative.
/// - Arithmetic is checked; overflow is an error, never a wrap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub struct Amount(
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "0i64..=i64::MAX")
    )]
    i64,
);

impl Amount {
    /// An [`Amount`] of zero.
    pub const ZERO: Self = Self(0);

    /// Construct an [`Amount`] from a minor-unit value which is already known
    /// to be non-negative (e.g. a checked DB column).
    pub fn from_cents(cents: i64) -> Result<Self, Error> {
        if cents >= 0 {
            Ok(Self(cents))
        } else {
            Err(Error::Negative)
        }
    }

    /// Parse a major-unit decimal string (e.g. ePayco's `"55000.00"` pesos)
    /// and convert to minor units (×100).
    pub fn from_major_str(s: &str) -> Result<Self, Error> {
        let major = Decimal::from_str(s).map_err(|_| Error::NotANumber)?;
        Self::from_major(major)
    }

    /// Convert a major-unit [`Decimal`] to minor units (×100).
    pub fn from_major(major: Decimal) -> Result<Self, Error> {
        let minor = major
            .checked_mul(Decimal::from(100))
            .ok_or(Error::Overflow)?;
        let cents = minor.round().to_i64().ok_or(Error::Overflow)?;
        Self::from_cents(cents)
    }

    /// Parse a minor-unit decimal string (e.g. Cobre's `"100000"` cents).
    pub fn from_minor_str(s: &str) -> Result<Self, Error> {
        let minor = Decimal::from_str(s).map_err(|_| Error::NotANumber)?;
        let cents = minor.round().to_i64().ok_or(Error::Overflow)?;
        Self::from_cents(cents)
    }

    /// Returns the contained minor-unit value.
    #[inline]
    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Result<Self, Error> {
        self.0.checked_add(other.0).ok_or(Error::Overflow).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Result<Self, Error> {
        let diff = self.0.checked_sub(other.0).ok_or(Error::Overflow)?;
        Self::from_cents(diff)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Self::from_cents(value).map_err(|_| {
            serde::de::Error::invalid_value(
                serde::de::Unexpected::Signed(value),
                &"a non-negative minor-unit amount",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn major_to_minor_conversion() {
        assert_eq!(Amount::from_major_str("1000").unwrap().cents(), 100_000);
        assert_eq!(Amount::from_major_str("550.50").unwrap().cents(), 55_050);
        assert_eq!(Amount::from_major_str("0").unwrap(), Amount::ZERO);
        assert!(Amount::from_major_str("-1").is_err());
        assert!(Amount::from_major_str("pesos").is_err());
    }

    #[test]
    fn minor_passthrough() {
        assert_eq!(Amount::from_minor_str("100000").unwrap().cents(), 100_000);
        // Some gateways stringify minor units with a trailing ".00".
        assert_eq!(Amount::from_minor_str("100000.00").unwrap().cents(), 100_000);
    }

    #[test]
    fn serde_rejects_negative() {
        assert!(serde_json::from_str::<Amount>("-42").is_err());
        assert_eq!(serde_json::from_str::<Amount>("42").unwrap().cents(), 42);
    }

    #[test]
    fn checked_arithmetic_roundtrip() {
        proptest!(|(a in 0i64..=i64::MAX / 2, b in 0i64..=i64::MAX / 2)| {
            let a = Amount::from_cents(a).unwrap();
            let b = Amount::from_cents(b).unwrap();
            let sum = a.checked_add(b).unwrap();
            prop_assert_eq!(sum.checked_sub(b).unwrap(), a);
        })
    }
}
