use crate::error::SettlementError;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Largest amount a single ledger entry may carry. Anything above is treated
/// as a data error rather than money owed.
pub const AMOUNT_CEILING: Decimal = dec!(10000);

/// A monetary value in the platform currency.
///
/// Thin wrapper around `rust_decimal::Decimal` so that liquidity tracking and
/// price arithmetic never go through floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Rounds to cents, midpoint away from zero.
    pub fn round_cents(self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// A strictly positive amount, bounded by [`AMOUNT_CEILING`].
///
/// Used for everything that moves money: ledger entries, transfers, checkout
/// totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, SettlementError> {
        if value <= Decimal::ZERO {
            return Err(SettlementError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }
        if value > AMOUNT_CEILING {
            return Err(SettlementError::ValidationError(format!(
                "Amount {} exceeds the ceiling of {}",
                value, AMOUNT_CEILING
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = SettlementError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Money {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_arithmetic() {
        let a = Money::new(dec!(10.0));
        let b = Money::new(dec!(2.5));
        assert_eq!(a + b, Money::new(dec!(12.5)));
        assert_eq!(a - b, Money::new(dec!(7.5)));

        let mut c = a;
        c -= b;
        c += Money::new(dec!(0.5));
        assert_eq!(c, Money::new(dec!(8.0)));
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(Money::new(dec!(11.505)).round_cents(), Money::new(dec!(11.51)));
        assert_eq!(Money::new(dec!(11.5)).round_cents(), Money::new(dec!(11.50)));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(Amount::new(dec!(10000)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(SettlementError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(SettlementError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(15000)),
            Err(SettlementError::ValidationError(_))
        ));
    }

    #[test]
    fn test_amount_deserialize_rejects_zero() {
        let parsed: Result<Amount, _> = serde_json::from_str("\"0\"");
        assert!(parsed.is_err());
        let parsed: Amount = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(parsed.value(), dec!(12.5));
    }
}
