//! Memory size quantities

use crate::{quantity, scale, IResult};
use nom::{combinator::all_consuming, Parser};
use thiserror::Error;

/// Parse a signed memory size into a number of bytes
///
/// The grammar is an optional `+` or `-` sign, a decimal number, and an
/// optional case-insensitive unit among `B`, `K`/`KB`, `M`/`MB`, `G`/`GB` and
/// `T`/`TB`. Units are binary multiples (1K = 1024 bytes), and a missing unit
/// means bytes. Fractional byte counts are truncated towards zero.
///
pub fn parse_size(s: &str) -> Result<i64, SizeError> {
    let Ok((_, (sign, (number, unit)))) = all_consuming(signed_quantity).parse(s) else {
        return Err(SizeError::Malformed(s.to_owned()));
    };
    let multiplier = unit_multiplier(unit).ok_or_else(|| SizeError::UnknownUnit {
        input: s.to_owned(),
        unit: unit.to_owned(),
    })?;
    let magnitude = scale(number, multiplier)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| SizeError::OutOfRange(s.to_owned()))?;
    Ok(if sign == Some('-') {
        -magnitude
    } else {
        magnitude
    })
}

/// Failure to parse a memory size
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SizeError {
    /// Input does not look like a size
    #[error("invalid size {0:?}")]
    Malformed(String),

    /// Size unit is not supported
    #[error("unknown size unit {unit:?} in {input:?}")]
    UnknownUnit {
        /// Full size string
        input: String,

        /// Unsupported unit
        unit: String,
    },

    /// Size does not fit in a signed 64-bit byte count
    #[error("size {0:?} is out of range")]
    OutOfRange(String),
}

/// Parser recognizing an optionally signed quantity
fn signed_quantity(s: &str) -> IResult<(Option<char>, (&str, &str))> {
    use nom::{character::complete::one_of, combinator::opt};
    opt(one_of("+-")).and(quantity).parse(s)
}

/// Number of bytes in one unit
fn unit_multiplier(unit: &str) -> Option<u64> {
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return None,
    };
    Some(multiplier)
}
