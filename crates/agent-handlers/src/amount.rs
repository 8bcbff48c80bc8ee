use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Number of fractional digits carried by [`Amount`].
pub const AMOUNT_DECIMALS: u32 = 6;

const SCALE: u128 = 1_000_000;

/// Fixed-point token amount stored as micro-units (six decimal places).
///
/// Stablecoin amounts are compared and accumulated exactly; floating point
/// only appears at the parsing edge when a caller hands us a JSON number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micros(micros: u128) -> Self {
        Self(micros)
    }

    pub const fn from_units(units: u64) -> Self {
        Self(units as u128 * SCALE)
    }

    pub const fn micros(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Multiplies by a rate that is itself expressed as an [`Amount`]
    /// (e.g. `0.92` for USD to EUR), truncating below one micro-unit.
    pub fn mul_rate(self, rate: Amount) -> Option<Amount> {
        self.0.checked_mul(rate.0).map(|raw| Amount(raw / SCALE))
    }

    /// Parses a decimal string such as `"50"`, `"50.00"` or `"0.000001"`.
    pub fn parse(value: &str) -> Result<Self, AmountError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AmountError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(AmountError::Negative(trimmed.to_string()));
        }

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountError::Invalid(trimmed.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountError::Invalid(trimmed.to_string()));
        }
        if fraction.len() > AMOUNT_DECIMALS as usize {
            return Err(AmountError::Precision(trimmed.to_string()));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| AmountError::Invalid(trimmed.to_string()))?
        };
        let mut fraction_micros: u128 = 0;
        for (idx, digit) in fraction.chars().enumerate() {
            let digit = digit.to_digit(10).unwrap_or(0) as u128;
            fraction_micros += digit * 10u128.pow(AMOUNT_DECIMALS - 1 - idx as u32);
        }

        whole
            .checked_mul(SCALE)
            .and_then(|micros| micros.checked_add(fraction_micros))
            .map(Amount)
            .ok_or_else(|| AmountError::Overflow(trimmed.to_string()))
    }

    /// Reads an amount from a JSON entity value (string or number).
    pub fn from_json(value: &Value) -> Result<Self, AmountError> {
        match value {
            Value::String(text) => Self::parse(text),
            Value::Number(number) => {
                if let Some(units) = number.as_u64() {
                    return Ok(Self::from_units(units));
                }
                match number.as_f64() {
                    Some(float) if float.is_finite() && float >= 0.0 => {
                        Self::parse(&format!("{:.6}", float))
                    }
                    Some(float) if float < 0.0 => Err(AmountError::Negative(number.to_string())),
                    _ => Err(AmountError::Invalid(number.to_string())),
                }
            }
            other => Err(AmountError::Invalid(other.to_string())),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let fraction = format!("{:06}", self.0 % SCALE);
        let trimmed = fraction.trim_end_matches('0');
        if trimmed.len() <= 2 {
            write!(f, "{}.{}", whole, &fraction[..2])
        } else {
            write!(f, "{}.{}", whole, trimmed)
        }
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Amount::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount must not be negative: {0}")]
    Negative(String),
    #[error("amount has more than six decimal places: {0}")]
    Precision(String),
    #[error("amount is too large: {0}")]
    Overflow(String),
    #[error("invalid amount: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_displays_two_decimals() {
        let amount = Amount::parse("50").unwrap();
        assert_eq!(amount, Amount::from_units(50));
        assert_eq!(amount.to_string(), "50.00");
        assert_eq!(Amount::parse("45.5").unwrap().to_string(), "45.50");
        assert_eq!(Amount::parse("0.000001").unwrap().micros(), 1);
        assert_eq!(Amount::parse("1.234567").unwrap().to_string(), "1.234567");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Amount::parse(""), Err(AmountError::Empty));
        assert!(matches!(Amount::parse("-1"), Err(AmountError::Negative(_))));
        assert!(matches!(Amount::parse("1.0000001"), Err(AmountError::Precision(_))));
        assert!(matches!(Amount::parse("1e5"), Err(AmountError::Invalid(_))));
        assert!(matches!(Amount::parse("."), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn reads_json_numbers_and_strings() {
        assert_eq!(Amount::from_json(&json!(10)).unwrap(), Amount::from_units(10));
        assert_eq!(Amount::from_json(&json!(2.5)).unwrap(), Amount::parse("2.5").unwrap());
        assert_eq!(Amount::from_json(&json!("7.25")).unwrap().to_string(), "7.25");
        assert!(Amount::from_json(&json!(true)).is_err());
    }

    #[test]
    fn applies_rates_in_fixed_point() {
        let usd = Amount::from_units(100);
        let rate = Amount::parse("0.92").unwrap();
        assert_eq!(usd.mul_rate(rate).unwrap().to_string(), "92.00");
    }
}
