//! Decimal-string big-integer wire type.
//!
//! Sub-RAV fields such as `chainId`, `channelEpoch`, `accumulatedAmount`, and
//! `nonce` are unsigned big integers. `JavaScript`'s `Number` cannot represent
//! the full range of a `u128` without losing precision, so the wire format
//! encodes them as decimal strings. [`BigAmount`] mirrors that convention on
//! the Rust side: a thin `u128` wrapper that round-trips through a string on
//! the serde boundary, the same pattern the wire-format layer uses for its
//! own large integers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An unsigned big integer, serialized as a decimal string in JSON.
///
/// ```json
/// "123456789012345678901234567890"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BigAmount(u128);

impl BigAmount {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates a new [`BigAmount`] from a raw `u128`.
    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the inner `u128` value.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Returns `true` if this amount is non-decreasing relative to `other`,
    /// i.e. `self >= other`.
    #[must_use]
    pub const fn is_non_decreasing_from(self, other: Self) -> bool {
        self.0 >= other.0
    }

    /// Saturating addition, used when accumulating settled cost onto a
    /// running total.
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction, used to compute unsettled balances.
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<u128> for BigAmount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<u64> for BigAmount {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl From<BigAmount> for u128 {
    fn from(value: BigAmount) -> Self {
        value.0
    }
}

impl fmt::Display for BigAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing a [`BigAmount`] from a malformed string.
#[derive(Debug, thiserror::Error)]
#[error("invalid big-integer amount: {0}")]
pub struct BigAmountParseError(String);

impl FromStr for BigAmount {
    type Err = BigAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>()
            .map(Self)
            .map_err(|_| BigAmountParseError(s.to_owned()))
    }
}

impl Serialize for BigAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BigAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Legacy persisted state may have stored amounts as JSON numbers;
        // accept either representation and normalize to the canonical string
        // form going forward (see `subrav::persist`).
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            String(String),
            Number(u128),
        }

        match Repr::deserialize(deserializer)? {
            Repr::String(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Self(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_string() {
        let amount = BigAmount::new(123_456_789_012_345_678);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"123456789012345678\"");
        let parsed: BigAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, amount);
    }

    #[test]
    fn accepts_legacy_numeric_form() {
        let parsed: BigAmount = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, BigAmount::new(42));
    }

    #[test]
    fn rejects_non_numeric_string() {
        let err = "not-a-number".parse::<BigAmount>().unwrap_err();
        assert!(err.to_string().contains("invalid big-integer amount"));
    }
}
