// Amount normalization: fiat decimals to ledger smallest units

use crate::errors::{IssuanceError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest token precision the normalizer accepts; 10^18 still fits in a u64.
pub const MAX_TOKEN_DECIMALS: u32 = 18;

/// Largest unit count the ledger and the BIGINT columns can both hold.
pub const MAX_LEDGER_UNITS: u64 = i64::MAX as u64;

/// Every amount deserialization error mentions this phrase.
const AMOUNT_ERROR_MARKER: &str = "fiat amount";

/// Classifies a request body parse error. Failures to read an amount field
/// become `InvalidAmount`, everything else `Validation`.
pub fn body_error(message: String) -> IssuanceError {
    if message.contains(AMOUNT_ERROR_MARKER) {
        IssuanceError::InvalidAmount(message)
    } else {
        IssuanceError::Validation(message)
    }
}

/// Fiat amount as supplied by a caller.
///
/// JSON numbers are read through their shortest decimal rendering, so `12.34`
/// becomes exactly `12.34` rather than the nearest binary float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FiatAmount(Decimal);

impl FiatAmount {
    pub fn new(value: Decimal) -> Self {
        FiatAmount(value)
    }

    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(IssuanceError::InvalidAmount(format!(
                "amount must be finite, got {}",
                value
            )));
        }

        Decimal::from_str(&value.to_string())
            .map(FiatAmount)
            .map_err(|e| IssuanceError::InvalidAmount(format!("{}: {}", value, e)))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for FiatAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Decimal> for FiatAmount {
    fn from(value: Decimal) -> Self {
        FiatAmount(value)
    }
}

struct FiatAmountVisitor;

impl<'de> Visitor<'de> for FiatAmountVisitor {
    type Value = FiatAmount;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a fiat amount as a JSON number or string")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<FiatAmount, E> {
        Ok(FiatAmount(Decimal::from(value)))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<FiatAmount, E> {
        Ok(FiatAmount(Decimal::from(value)))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> std::result::Result<FiatAmount, E> {
        FiatAmount::from_f64(value).map_err(|e| E::custom(format!("invalid fiat amount: {}", e)))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<FiatAmount, E> {
        Decimal::from_str(value.trim())
            .map(FiatAmount)
            .map_err(|e| E::custom(format!("invalid fiat amount '{}': {}", value, e)))
    }
}

impl<'de> Deserialize<'de> for FiatAmount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FiatAmountVisitor)
    }
}

/// Converts fiat amounts into the ledger's fixed-point integer units.
///
/// The amount is scaled by `10^decimals` and rounded half away from zero.
/// Inputs carrying more fractional digits than the token precision are rejected
/// instead of rounded, so a retried event can never normalize differently.
#[derive(Debug, Clone, Copy)]
pub struct AmountNormalizer {
    decimals: u32,
}

impl AmountNormalizer {
    pub fn new(decimals: u32) -> Result<Self> {
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(IssuanceError::Config(format!(
                "token decimals {} exceeds maximum {}",
                decimals, MAX_TOKEN_DECIMALS
            )));
        }
        Ok(AmountNormalizer { decimals })
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn to_smallest_unit(&self, amount: FiatAmount) -> Result<u64> {
        to_smallest_unit(amount.value(), self.decimals)
    }

    pub fn from_smallest_unit(&self, units: u64) -> Decimal {
        from_smallest_unit(units, self.decimals)
    }
}

pub fn to_smallest_unit(amount: Decimal, decimals: u32) -> Result<u64> {
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(IssuanceError::Config(format!(
            "token decimals {} exceeds maximum {}",
            decimals, MAX_TOKEN_DECIMALS
        )));
    }

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(IssuanceError::InvalidAmount(format!(
            "amount must not be negative, got {}",
            amount
        )));
    }

    let normalized = amount.normalize();
    if normalized.scale() > decimals {
        return Err(IssuanceError::InvalidAmount(format!(
            "{} has more than {} fractional digits",
            normalized, decimals
        )));
    }

    let factor = Decimal::from(10u64.pow(decimals));
    let scaled = normalized
        .checked_mul(factor)
        .ok_or_else(|| IssuanceError::InvalidAmount(format!("{} overflows", amount)))?;

    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .filter(|units| *units <= MAX_LEDGER_UNITS)
        .ok_or_else(|| {
            IssuanceError::InvalidAmount(format!("{} exceeds the ledger unit range", amount))
        })
}

pub fn from_smallest_unit(units: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(units as i128, decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_converts_two_decimal_amounts() {
        assert_eq!(to_smallest_unit(dec!(12.34), 2).unwrap(), 1234);
        assert_eq!(to_smallest_unit(dec!(5.00), 2).unwrap(), 500);
        assert_eq!(to_smallest_unit(dec!(5), 2).unwrap(), 500);
        assert_eq!(to_smallest_unit(dec!(0.01), 2).unwrap(), 1);
        assert_eq!(to_smallest_unit(dec!(0), 2).unwrap(), 0);
    }

    #[test]
    fn test_trailing_zeros_do_not_count_as_precision() {
        assert_eq!(to_smallest_unit(dec!(1.2300000), 2).unwrap(), 123);
    }

    #[test]
    fn test_rejects_excess_precision() {
        let err = to_smallest_unit(dec!(1.005), 2).unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidAmount(_)));
    }

    #[test]
    fn test_rejects_negative_amounts() {
        let err = to_smallest_unit(dec!(-0.01), 2).unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidAmount(_)));
    }

    #[test]
    fn test_rejects_non_finite_floats() {
        assert!(FiatAmount::from_f64(f64::NAN).is_err());
        assert!(FiatAmount::from_f64(f64::INFINITY).is_err());
        assert!(FiatAmount::from_f64(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_float_input_uses_shortest_representation() {
        // 0.1 + 0.2 style artifacts must not leak into the unit count
        let amount = FiatAmount::from_f64(12.34).unwrap();
        assert_eq!(amount.value(), dec!(12.34));

        let normalizer = AmountNormalizer::new(2).unwrap();
        assert_eq!(normalizer.to_smallest_unit(amount).unwrap(), 1234);
    }

    #[test]
    fn test_rejects_amounts_beyond_unit_range() {
        let err = to_smallest_unit(dec!(79228162514264337593543950335), 2).unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidAmount(_)));
    }

    #[test]
    fn test_unit_range_stops_at_signed_maximum() {
        assert_eq!(
            to_smallest_unit(dec!(92233720368547758.07), 2).unwrap(),
            i64::MAX as u64
        );

        // Fits a u64 but not a BIGINT column
        let err = to_smallest_unit(dec!(100000000000000000), 2).unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidAmount(_)));
        let err = to_smallest_unit(dec!(92233720368547758.08), 2).unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidAmount(_)));
    }

    #[test]
    fn test_round_trip_for_every_cent_up_to_hundred() {
        let normalizer = AmountNormalizer::new(2).unwrap();
        for cents in 0..10_000u64 {
            let amount = Decimal::from_i128_with_scale(cents as i128, 2);
            let units = normalizer.to_smallest_unit(FiatAmount::new(amount)).unwrap();
            assert_eq!(units, cents);
            assert_eq!(normalizer.from_smallest_unit(units), amount);
            // deterministic across retries
            assert_eq!(normalizer.to_smallest_unit(FiatAmount::new(amount)).unwrap(), units);
        }
    }

    #[test]
    fn test_deserializes_numbers_and_strings() {
        let from_number: FiatAmount = serde_json::from_str("12.34").unwrap();
        let from_string: FiatAmount = serde_json::from_str("\"12.34\"").unwrap();
        let from_integer: FiatAmount = serde_json::from_str("12").unwrap();

        assert_eq!(from_number.value(), dec!(12.34));
        assert_eq!(from_string.value(), dec!(12.34));
        assert_eq!(from_integer.value(), dec!(12));
        assert!(serde_json::from_str::<FiatAmount>("\"twelve\"").is_err());
    }

    #[test]
    fn test_amount_parse_errors_classify_as_invalid_amount() {
        let word = serde_json::from_str::<FiatAmount>("\"twelve\"").unwrap_err();
        assert!(matches!(body_error(word.to_string()), IssuanceError::InvalidAmount(_)));

        let boolean = serde_json::from_str::<FiatAmount>("true").unwrap_err();
        assert!(matches!(body_error(boolean.to_string()), IssuanceError::InvalidAmount(_)));

        let other = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(body_error(other.to_string()), IssuanceError::Validation(_)));
    }

    #[test]
    fn test_rejects_excessive_decimals_configuration() {
        assert!(AmountNormalizer::new(19).is_err());
        assert_eq!(AmountNormalizer::new(18).unwrap().decimals(), 18);
    }
}
