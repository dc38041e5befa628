//! Time quantities

use crate::{quantity, scale};
use nom::{combinator::all_consuming, Parser};
use std::time::Duration;
use thiserror::Error;

/// Parse a duration
///
/// The grammar is an unsigned decimal number followed by an optional
/// case-insensitive unit among `ms`, `s`, `m` (minutes) and `h`. A bare number
/// is a number of seconds.
///
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let Ok((_, (number, unit))) = all_consuming(quantity).parse(s) else {
        return Err(DurationError::Malformed(s.to_owned()));
    };
    let unit = unit.to_ascii_lowercase();
    let out_of_range = || DurationError::OutOfRange(s.to_owned());
    match unit.as_str() {
        // Milliseconds are the only sub-second unit, handle them separately
        "ms" => {
            let nanos = scale(number, 1_000_000).ok_or_else(out_of_range)?;
            Ok(Duration::from_nanos(nanos))
        }
        "" | "s" | "m" | "h" => {
            let seconds_per_unit = match unit.as_str() {
                "m" => 60,
                "h" => 3600,
                _ => 1,
            };
            // Split integral and fractional seconds to avoid rounding
            // whole numbers of seconds through floating point
            if let Some(seconds) = number
                .parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(seconds_per_unit))
            {
                return Ok(Duration::from_secs(seconds));
            }
            let seconds = number
                .parse::<f64>()
                .map_err(|_| DurationError::Malformed(s.to_owned()))?
                * seconds_per_unit as f64;
            Duration::try_from_secs_f64(seconds).map_err(|_| out_of_range())
        }
        _ => Err(DurationError::UnknownUnit {
            input: s.to_owned(),
            unit,
        }),
    }
}

/// Failure to parse a duration
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DurationError {
    /// Input does not look like a duration
    #[error("invalid duration {0:?}")]
    Malformed(String),

    /// Time unit is not supported
    #[error("unknown time unit {unit:?} in {input:?}")]
    UnknownUnit {
        /// Full duration string
        input: String,

        /// Unsupported unit, lowercased
        unit: String,
    },

    /// Duration is too long to be represented
    #[error("duration {0:?} is out of range")]
    OutOfRange(String),
}
