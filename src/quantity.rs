//! Resource quantity parsing
//!
//! Kubernetes expresses CPU and memory amounts as strings such as `500m`,
//! `2`, `128Mi`, or `1.5Gi`. The API server only rejects malformed amounts
//! at admission time; parsing them here keeps garbage out of the objects we
//! send in the first place.

use std::fmt;

use thiserror::Error;

/// Decimal SI suffixes accepted by the platform (`m` is milli, the rest scale up).
const DECIMAL_SUFFIXES: [&str; 7] = ["m", "k", "M", "G", "T", "P", "E"];

/// Binary (power-of-two) suffixes accepted by the platform.
const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// Rejection of a malformed quantity string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed quantity {value:?}: {reason}")]
pub struct QuantityError {
    /// The string that failed to parse.
    pub value: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

/// Unit suffix of a parsed [`Quantity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    /// Bare number, no unit.
    None,
    /// One of `m k M G T P E`.
    Decimal(&'static str),
    /// One of `Ki Mi Gi Ti Pi Ei`.
    Binary(&'static str),
    /// Scientific-notation exponent (`1e3`, `2E-2`).
    Exponent(i32),
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suffix::None => Ok(()),
            Suffix::Decimal(s) | Suffix::Binary(s) => f.write_str(s),
            Suffix::Exponent(exp) => write!(f, "e{}", exp),
        }
    }
}

/// A validated resource amount, split into its numeric part and unit suffix.
///
/// The numeric part is kept exactly as written so the amount round-trips
/// into API objects without floating-point drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantity {
    number: String,
    suffix: Suffix,
}

impl Quantity {
    /// Parse a quantity string into its structured form.
    ///
    /// The accepted grammar is the platform's: an optionally signed decimal
    /// number followed by at most one suffix, where a fractional part must
    /// have digits on both sides of the dot.
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let fail = |reason: &'static str| QuantityError {
            value: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(fail("empty string"));
        }

        let bytes = input.as_bytes();
        let mut idx = 0;
        if bytes[idx] == b'+' || bytes[idx] == b'-' {
            idx += 1;
        }

        let mut integer_digits = 0;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            integer_digits += 1;
            idx += 1;
        }
        if integer_digits == 0 {
            return Err(fail("no digits before the unit"));
        }

        if idx < bytes.len() && bytes[idx] == b'.' {
            idx += 1;
            let mut fraction_digits = 0;
            while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                fraction_digits += 1;
                idx += 1;
            }
            if fraction_digits == 0 {
                return Err(fail("no digits after the decimal point"));
            }
        }

        let (number, rest) = input.split_at(idx);
        let suffix = if rest.is_empty() {
            Suffix::None
        } else if let Some(s) = BINARY_SUFFIXES.iter().find(|s| **s == rest) {
            Suffix::Binary(s)
        } else if let Some(s) = DECIMAL_SUFFIXES.iter().find(|s| **s == rest) {
            Suffix::Decimal(s)
        } else if rest.starts_with('e') || rest.starts_with('E') {
            let exp = rest[1..]
                .parse::<i32>()
                .map_err(|_| fail("invalid exponent"))?;
            Suffix::Exponent(exp)
        } else {
            return Err(fail("unknown unit suffix"));
        };

        Ok(Quantity {
            number: number.to_string(),
            suffix,
        })
    }

    /// The numeric part exactly as written (`"1.5"` of `1.5Gi`).
    pub fn number(&self) -> &str {
        &self.number
    }

    /// The unit suffix.
    pub fn suffix(&self) -> Suffix {
        self.suffix
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.number, self.suffix)
    }
}

impl std::str::FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}
