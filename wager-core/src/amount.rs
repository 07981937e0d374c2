use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of minor units per currency unit.
pub const AMOUNT_SCALE: i64 = 1000;

/// Decimal places carried by the raw representation.
const SCALE_DIGITS: u32 = 3;

/// Decimal places used when rendering amounts for humans.
const DISPLAY_DIGITS: u32 = 2;

/// Errors raised while turning a decimal string into an [`Amount`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}: not a decimal number")]
    Invalid(String),
    #[error("invalid amount {0:?}: must not be negative")]
    Negative(String),
    #[error("invalid amount {0:?}: out of range")]
    OutOfRange(String),
}

/// Signed fixed-point currency value, stored as thousandths of a unit.
///
/// Stakes are always parsed as non-negative amounts; balances and deltas
/// reuse the same type and may go below zero.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Wrap an already scaled value.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Scaled integer value (thousandths).
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Parse a stake from its decimal string form.
    ///
    /// The value is multiplied by [`AMOUNT_SCALE`] and rounded to the nearest
    /// integer, midpoints away from zero.
    pub fn parse(raw: &str) -> Result<Self, AmountError> {
        let trimmed = raw.trim();
        let value = Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map_err(|_| AmountError::Invalid(raw.to_string()))?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative(raw.to_string()));
        }
        let scaled = value
            .checked_mul(Decimal::from(AMOUNT_SCALE))
            .ok_or_else(|| AmountError::OutOfRange(raw.to_string()))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        scaled
            .to_i64()
            .map(Self)
            .ok_or_else(|| AmountError::OutOfRange(raw.to_string()))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Exact decimal view of the scaled value.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, SCALE_DIGITS)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rounded = self
            .to_decimal()
            .round_dp_with_strategy(DISPLAY_DIGITS, RoundingStrategy::MidpointAwayFromZero);
        // keeps sub-cent negatives from rendering as "-0.00"
        let rounded = if rounded.is_zero() {
            Decimal::ZERO
        } else {
            rounded
        };
        write!(f, "{:.2}", rounded)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
