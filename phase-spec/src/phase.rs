//! Phase descriptions

use crate::{
    duration::{parse_duration, DurationError},
    size::{parse_size, SizeError},
};
use phase_engine::{CpuPhase, MemoryPhase, Phase, SleepPhase};
use thiserror::Error;

/// Parse a phase description such as `type=mem,abs=2G`
///
/// Keys and the phase type are case-insensitive, and when a key is repeated,
/// the last occurrence wins. Keys that do not apply to the phase type are
/// ignored with a warning.
///
pub fn parse_phase(spec: &str) -> Result<Phase, PhaseSpecError> {
    let pairs = key_values(spec)?;
    let kind = pairs
        .iter()
        .rev()
        .find(|(key, _)| key == "type")
        .map(|(_, value)| value.to_ascii_lowercase())
        .ok_or(PhaseSpecError::MissingType)?;
    let phase = match kind.as_str() {
        "mem" => Phase::Memory(memory_phase(&pairs)?),
        "cpu" => Phase::Cpu(cpu_phase(&pairs)?),
        "sleep" => Phase::Sleep(sleep_phase(&pairs)?),
        _ => return Err(PhaseSpecError::UnknownType(kind)),
    };
    log::debug!("Parsed {spec:?} into {phase:?}");
    Ok(phase)
}

/// Failure to parse a phase description
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PhaseSpecError {
    /// A comma-separated segment is not a `key=value` pair
    #[error("expected key=value, got {0:?}")]
    MalformedPair(String),

    /// No `type` key was specified
    #[error("phase type is missing")]
    MissingType,

    /// Phase type is not one of `mem`, `cpu` or `sleep`
    #[error("unknown phase type {0:?}")]
    UnknownType(String),

    /// A memory phase specifies a negative absolute size
    #[error("absolute memory size {0:?} must not be negative")]
    NegativeAbsolute(String),

    /// A memory phase specifies neither an absolute size nor a nonzero delta
    #[error("memory phase needs abs=<SIZE> or a nonzero delta=<SIZE>")]
    EmptyMemoryPhase,

    /// Thread count is not a non-negative integer
    #[error("invalid thread count {0:?}")]
    InvalidThreads(String),

    /// Utilization is not a finite number
    #[error("invalid utilization {0:?}")]
    InvalidUtilization(String),

    /// Failed to parse a memory size
    #[error(transparent)]
    Size(#[from] SizeError),

    /// Failed to parse a duration
    #[error(transparent)]
    Duration(#[from] DurationError),
}

/// Split a phase description into lowercased keys and raw values
fn key_values(spec: &str) -> Result<Vec<(String, &str)>, PhaseSpecError> {
    spec.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim()))
                .ok_or_else(|| PhaseSpecError::MalformedPair(segment.to_owned()))
        })
        .collect()
}

/// Warn about a key that has no meaning for a phase type
fn ignore_key(key: &str, kind: &str) {
    log::warn!("Ignoring key {key:?}, which does not apply to {kind} phases");
}

/// Interpret the keys of a memory phase
fn memory_phase(pairs: &[(String, &str)]) -> Result<MemoryPhase, PhaseSpecError> {
    let mut phase = MemoryPhase::default();
    for (key, value) in pairs {
        match key.as_str() {
            "type" => {}
            "abs" => {
                let bytes = parse_size(value)?;
                let bytes = u64::try_from(bytes)
                    .map_err(|_| PhaseSpecError::NegativeAbsolute((*value).to_owned()))?;
                phase.absolute = Some(bytes);
            }
            "delta" => {
                let delta = parse_size(value)?;
                phase.delta = (delta != 0).then_some(delta);
            }
            "duration" => phase.hold = Some(parse_duration(value)?),
            other => ignore_key(other, "mem"),
        }
    }
    if phase.absolute.is_none() && phase.delta.is_none() {
        return Err(PhaseSpecError::EmptyMemoryPhase);
    }
    Ok(phase)
}

/// Interpret the keys of a CPU phase
fn cpu_phase(pairs: &[(String, &str)]) -> Result<CpuPhase, PhaseSpecError> {
    let mut phase = CpuPhase::default();
    for (key, value) in pairs {
        match key.as_str() {
            "type" => {}
            "threads" => {
                phase.workers = value
                    .parse()
                    .map_err(|_| PhaseSpecError::InvalidThreads((*value).to_owned()))?;
            }
            "util" => {
                phase.utilization = value
                    .parse::<f64>()
                    .ok()
                    .filter(|util| util.is_finite())
                    .ok_or_else(|| PhaseSpecError::InvalidUtilization((*value).to_owned()))?;
            }
            "duration" => phase.duration = parse_duration(value)?,
            other => ignore_key(other, "cpu"),
        }
    }
    Ok(phase)
}

/// Interpret the keys of a sleep phase
fn sleep_phase(pairs: &[(String, &str)]) -> Result<SleepPhase, PhaseSpecError> {
    let mut phase = SleepPhase::default();
    for (key, value) in pairs {
        match key.as_str() {
            "type" => {}
            "duration" => phase.duration = parse_duration(value)?,
            other => ignore_key(other, "sleep"),
        }
    }
    Ok(phase)
}
