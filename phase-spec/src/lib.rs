//! Parser for textual workload phase descriptions
//!
//! A phase is described as comma-separated `key=value` pairs, for example
//! `type=cpu,threads=4,util=0.4,duration=60s`. Quantities follow the SIZE
//! grammar (see [`parse_size()`]) or the TIME grammar (see
//! [`parse_duration()`]).

#![deny(missing_docs)]

mod duration;
mod phase;
mod size;

pub use self::{
    duration::{parse_duration, DurationError},
    phase::{parse_phase, PhaseSpecError},
    size::{parse_size, SizeError},
};
use nom::{error::Error, Parser};
use nom_supreme::ParserExt;

/// Result type returned by quantity parsers
pub type IResult<'a, O> = nom::IResult<&'a str, O, Error<&'a str>>;

/// Parser recognizing unsigned decimal numbers like `12`, `1.5`, `3.` or `.5`
fn decimal(s: &str) -> IResult<&str> {
    use nom::{
        branch::alt,
        character::complete::{char, digit0, digit1},
        combinator::opt,
        sequence::pair,
    };
    alt((
        pair(digit1, opt(pair(char('.'), digit0))).recognize(),
        pair(char('.'), digit1).recognize(),
    ))
    .parse(s)
}

/// Parser recognizing a quantity, i.e. a decimal number followed by a unit
///
/// The unit is returned as written, possibly empty. Checking it is left to the
/// caller, so that unknown units can be reported as such.
///
fn quantity(s: &str) -> IResult<(&str, &str)> {
    use nom::character::complete::alpha0;
    decimal.and(alpha0).parse(s)
}

/// Scale a decimal number by an integer multiplier
///
/// Integers are scaled exactly, fractional numbers go through floating-point
/// and are truncated towards zero. Returns `None` on overflow.
///
fn scale(number: &str, multiplier: u64) -> Option<u64> {
    if let Ok(integer) = number.parse::<u64>() {
        return integer.checked_mul(multiplier);
    }
    let value = number.parse::<f64>().ok()? * multiplier as f64;
    (value.is_finite() && value < u64::MAX as f64).then(|| value as u64)
}
