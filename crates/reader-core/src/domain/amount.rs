//! Transaction amount value type.
//!
//! Amounts are held as integer minor units (cents) so that no floating-point
//! rounding can creep into what the reader displays or the gateway charges.
//! Backends differ in how they want the amount on the wire: some take a
//! decimal string (`"1.00"`), others the EMV `n12` BCD form of the minor
//! units (`00 00 00 00 01 00`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest amount representable as 12 BCD digits.
pub const MAX_MINOR_UNITS: u64 = 999_999_999_999;

/// Errors raised when parsing or encoding an amount.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("amount {0:?} has more than two fraction digits")]
    TooPrecise(String),
    #[error("amount exceeds the 12-digit limit")]
    Overflow,
    #[error("invalid BCD digit in amount field")]
    InvalidBcd,
}

/// A non-negative amount in minor units (two fraction digits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount {
    minor_units: u64,
}

impl Amount {
    /// Creates an amount from minor units.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Overflow`] above [`MAX_MINOR_UNITS`].
    pub fn from_minor_units(minor_units: u64) -> Result<Self, AmountError> {
        if minor_units > MAX_MINOR_UNITS {
            return Err(AmountError::Overflow);
        }
        Ok(Self { minor_units })
    }

    pub fn minor_units(&self) -> u64 {
        self.minor_units
    }

    /// Renders the amount as a decimal string with two fraction digits.
    pub fn to_decimal_string(&self) -> String {
        format!("{}.{:02}", self.minor_units / 100, self.minor_units % 100)
    }

    /// Encodes the minor units as EMV `n12`: 12 BCD digits in 6 bytes.
    pub fn to_bcd_n12(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        let mut v = self.minor_units;
        for byte in out.iter_mut().rev() {
            let lo = (v % 10) as u8;
            v /= 10;
            let hi = (v % 10) as u8;
            v /= 10;
            *byte = (hi << 4) | lo;
        }
        out
    }

    /// Decodes an EMV `n12` BCD field.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::InvalidBcd`] if any nibble is above 9 or the
    /// field is not 6 bytes long.
    pub fn from_bcd_n12(bytes: &[u8]) -> Result<Self, AmountError> {
        if bytes.len() != 6 {
            return Err(AmountError::InvalidBcd);
        }
        let mut v = 0u64;
        for &b in bytes {
            let (hi, lo) = (b >> 4, b & 0x0F);
            if hi > 9 || lo > 9 {
                return Err(AmountError::InvalidBcd);
            }
            v = v * 100 + (hi as u64) * 10 + lo as u64;
        }
        Self::from_minor_units(v)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Parses `"1"`, `"1.5"`, `"1.50"`, or `"$1.50"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };

        let digits_only = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !digits_only(whole) || !digits_only(frac) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if frac.len() > 2 {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole: u64 = whole.parse().map_err(|_| AmountError::Overflow)?;
        let frac_units: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().unwrap_or(0) * 10,
            _ => frac.parse::<u64>().unwrap_or(0),
        };

        let minor = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac_units))
            .ok_or(AmountError::Overflow)?;
        Self::from_minor_units(minor)
    }
}
